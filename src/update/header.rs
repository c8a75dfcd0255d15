//! Streaming artifact header reader.
//!
//! A real artifact is a signed tar stream; parsing its full container
//! format is out of scope here. What the state engine actually needs is
//! the small header record — payload type, names, provides — followed by
//! the raw payload bytes fed to the update module's `Download` state. This
//! reader models exactly that boundary: the first newline-terminated line
//! of the stream is a JSON header, everything after it is payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Header metadata preceding an artifact's payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Update-module payload type, e.g. `rootfs-image`. Empty means
    /// "metadata only" — no module is invoked for this artifact.
    pub payload_type: String,
    /// Artifact name (non-empty).
    pub artifact_name: String,
    /// Deployment group this artifact belongs to.
    #[serde(default)]
    pub artifact_group: String,
    /// Key/value facts this artifact provides once installed.
    #[serde(default)]
    pub provides: Option<BTreeMap<String, String>>,
    /// Provides keys this artifact clears on install.
    #[serde(default)]
    pub clears_provides: Option<Vec<String>>,
}

/// Reads the header line from `source`, then hands back a reader
/// positioned at the start of the payload.
pub async fn read_header<R>(source: R) -> crate::error::Result<(ArtifactHeader, BufReader<R>)>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(crate::error::Error::Io)?;

    let header: ArtifactHeader = serde_json::from_str(line.trim_end())
        .map_err(|e| crate::error::UpdateError::DatabaseValue(format!("bad artifact header: {e}")))?;

    Ok((header, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_header_line_and_leaves_payload_intact() {
        let input = b"{\"payload_type\":\"rootfs-image\",\"artifact_name\":\"release-1\"}\npayload-bytes-follow";
        let (header, mut reader) = read_header(Cursor::new(input.to_vec())).await.unwrap();
        assert_eq!(header.payload_type, "rootfs-image");
        assert_eq!(header.artifact_name, "release-1");

        let mut rest = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, "payload-bytes-follow");
    }

    #[tokio::test]
    async fn empty_payload_type_marks_metadata_only_artifact() {
        let input = b"{\"payload_type\":\"\",\"artifact_name\":\"meta-1\"}\n";
        let (header, _) = read_header(Cursor::new(input.to_vec())).await.unwrap();
        assert!(header.payload_type.is_empty());
    }
}
