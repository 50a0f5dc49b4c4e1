//! MCP-Credential Refresher (spec §4.9). Rewrites a well-known JSON
//! configuration file in the worker's home directory so the
//! code-generation subprocess picks up a fresh installation token before
//! every invocation. Failures here are non-fatal — logged and ignored
//! (spec §4.9, §7 "Finalization" philosophy: the publish path degrades
//! gracefully rather than blocking the loop).

use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::warn;

const CREDENTIAL_ENV_VAR: &str = "GITHUB_TOKEN";

pub struct CredentialRefresher {
    config_path: PathBuf,
    server_name: String,
}

impl CredentialRefresher {
    pub fn new(home: PathBuf, server_name: impl Into<String>) -> Self {
        Self {
            config_path: home.join(".mcp.json"),
            server_name: server_name.into(),
        }
    }

    /// Read-or-create the config file, set the credential-consuming
    /// server's env entry to `token`, and write atomically (write to a
    /// temp file in the same directory, then rename).
    pub fn refresh(&self, token: &str) {
        if let Err(e) = self.try_refresh(token) {
            warn!(error = %e, path = %self.config_path.display(), "failed to refresh MCP credential file");
        }
    }

    fn try_refresh(&self, token: &str) -> Result<(), std::io::Error> {
        let mut doc = self.read_or_default()?;

        let servers = doc
            .as_object_mut()
            .expect("root is always an object")
            .entry("mcpServers")
            .or_insert_with(|| Value::Object(Map::new()));

        let server_entry = servers
            .as_object_mut()
            .expect("mcpServers is always an object")
            .entry(self.server_name.clone())
            .or_insert_with(|| Value::Object(Map::new()));

        let env = server_entry
            .as_object_mut()
            .expect("server entry is always an object")
            .entry("env")
            .or_insert_with(|| Value::Object(Map::new()));

        env.as_object_mut()
            .expect("env is always an object")
            .insert(CREDENTIAL_ENV_VAR.to_string(), Value::String(token.to_string()));

        self.write_atomically(&doc)
    }

    fn read_or_default(&self) -> Result<Value, std::io::Error> {
        match std::fs::read_to_string(&self.config_path) {
            Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_else(|_| Value::Object(Map::new()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(e),
        }
    }

    fn write_atomically(&self, doc: &Value) -> Result<(), std::io::Error> {
        let tmp_path = self.config_path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(doc).expect("Value always serializes");
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.config_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_creates_file_with_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let refresher = CredentialRefresher::new(dir.path().to_path_buf(), "github");
        refresher.refresh("tok-123");

        let contents = std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap();
        let doc: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(
            doc["mcpServers"]["github"]["env"]["GITHUB_TOKEN"],
            "tok-123"
        );
    }

    #[test]
    fn refresh_preserves_unrelated_servers() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".mcp.json"),
            r#"{"mcpServers":{"other":{"command":"x"}}}"#,
        )
        .unwrap();

        let refresher = CredentialRefresher::new(dir.path().to_path_buf(), "github");
        refresher.refresh("tok-456");

        let contents = std::fs::read_to_string(dir.path().join(".mcp.json")).unwrap();
        let doc: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(doc["mcpServers"]["other"]["command"], "x");
        assert_eq!(doc["mcpServers"]["github"]["env"]["GITHUB_TOKEN"], "tok-456");
    }
}
