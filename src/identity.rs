//! Identity collector: invokes an external "identity script" to produce a
//! key/value map identifying the device (spec §2 item 2, §3 `IdentityMap`).

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{IdentityError, Result};

/// Ordered sequence of `(key, value)` pairs produced by the identity script.
///
/// Duplicate keys are allowed and preserved in emission order: the script
/// may emit `key=value` multiple times with different values, and all are
/// retained (spec §9 Open Question 1 — the server contract for duplicates is
/// undocumented upstream, so this agent preserves the observed emission
/// byte-for-byte rather than silently deduplicating).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    pairs: Vec<(String, String)>,
}

impl IdentityMap {
    /// Iterate the pairs in emission order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as a JSON object whose values are arrays when a key repeats,
    /// and a bare string otherwise — this is the "JSON-stringified identity
    /// map" fed into the auth request body (spec §4.2).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Map, Value};
        let mut map: Map<String, Value> = Map::new();
        for (k, v) in &self.pairs {
            match map.get_mut(k) {
                None => {
                    map.insert(k.clone(), Value::String(v.clone()));
                }
                Some(Value::Array(arr)) => arr.push(Value::String(v.clone())),
                Some(existing) => {
                    let first = existing.clone();
                    *existing = Value::Array(vec![first, Value::String(v.clone())]);
                }
            }
        }
        Value::Object(map)
    }

    fn parse(stdout: &str) -> Self {
        let pairs = stdout
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { pairs }
    }
}

/// Runs the identity script and parses its `key=value` stdout lines.
pub struct IdentityCollector {
    script_path: std::path::PathBuf,
}

impl IdentityCollector {
    /// Create a collector that will invoke `script_path` with no arguments.
    #[must_use]
    pub fn new(script_path: impl AsRef<Path>) -> Self {
        Self {
            script_path: script_path.as_ref().to_path_buf(),
        }
    }

    /// Run the identity script and parse its output.
    pub async fn collect(&self) -> Result<IdentityMap> {
        let output = Command::new(&self.script_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| IdentityError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(IdentityError::ScriptFailed(
                output.status.code().unwrap_or(-1),
                stderr,
            )
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(IdentityMap::parse(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preserves_duplicate_keys_in_order() {
        let map = IdentityMap::parse("mac=aa:bb\nsn=123\nmac=cc:dd\n");
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(
            pairs,
            vec![("mac", "aa:bb"), ("sn", "123"), ("mac", "cc:dd")]
        );
    }

    #[test]
    fn to_json_collapses_repeats_into_an_array_but_keeps_singletons_bare() {
        let map = IdentityMap::parse("sn=123\nmac=aa\nmac=bb");
        let json = map.to_json();
        assert_eq!(json["sn"], serde_json::json!("123"));
        assert_eq!(json["mac"], serde_json::json!(["aa", "bb"]));
    }

    #[test]
    fn parse_ignores_lines_without_equals() {
        let map = IdentityMap::parse("not-a-pair\nkey=value\n\n");
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs, vec![("key", "value")]);
    }

    #[tokio::test]
    async fn collect_reports_nonzero_exit_as_script_failed() {
        let collector = IdentityCollector::new("/bin/false");
        let err = collector.collect().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Identity(IdentityError::ScriptFailed(_, _))
        ));
    }

    #[tokio::test]
    async fn collect_parses_real_script_output() {
        let script = std::env::temp_dir().join("identity_agent_test_script.sh");
        tokio::fs::write(&script, "#!/bin/sh\necho mac=de:ad:be:ef\necho sn=42\n")
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&script).await.unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        tokio::fs::set_permissions(&script, perms).await.unwrap();

        let collector = IdentityCollector::new(&script);
        let map = collector.collect().await.unwrap();
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs, vec![("mac", "de:ad:be:ef"), ("sn", "42")]);

        let _ = tokio::fs::remove_file(&script).await;
    }
}
