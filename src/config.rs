//! Process configuration, loaded once at startup from the environment
//! (spec.md §6). Validation is eager: a misconfigured process exits
//! non-zero before the scheduler ever starts (spec.md §7 "Configuration").

use crate::error::ConfigError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub repo: String,
    pub base_branch: String,
    pub trigger_label: String,
    pub poll_interval: Duration,
    pub max_open_change_sets: usize,
    pub auto_fix_conflicts: bool,
    pub auto_fix_go_mod: bool,
    pub auto_fix_precommit: bool,

    pub app_id: u64,
    pub app_installation_id: u64,
    pub private_key: PrivateKeySource,

    pub worker_id: Option<String>,

    pub branch_prefix: String,

    pub workspace_dir: String,
    pub subprocess_binary: String,
    pub mcp_server_name: String,
}

#[derive(Debug, Clone)]
pub enum PrivateKeySource {
    Inline(String),
    Path(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let repo = require_var("REPO")?;
        let base_branch = optional_var("BRANCH", "main");
        let trigger_label = optional_var("TRIGGER_LABEL", "agent-ready");

        let poll_interval_secs = parse_optional("POLL_INTERVAL_SECONDS", 60u64)?;
        let max_open_change_sets = parse_optional("MAX_OPEN_CHANGESETS", 3usize)?;

        let auto_fix_conflicts = parse_bool_flag("AUTO_FIX_CONFLICTS", true);
        let auto_fix_go_mod = parse_bool_flag("AUTO_FIX_GO_MOD", true);
        let auto_fix_precommit = parse_bool_flag("AUTO_FIX_PRECOMMIT", true);

        let app_id = require_parsed("APP_ID")?;
        let app_installation_id = require_parsed("APP_INSTALLATION_ID")?;
        let private_key = load_private_key_source()?;

        let worker_id = std::env::var("WORKER_ID").ok();

        let workspace_dir = optional_var("WORKSPACE_DIR", "./workspace");
        let subprocess_binary = optional_var("CODER_BINARY", "claude");
        let mcp_server_name = optional_var("MCP_SERVER_NAME", "github");

        Ok(Self {
            repo,
            base_branch,
            trigger_label,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_open_change_sets,
            auto_fix_conflicts,
            auto_fix_go_mod,
            auto_fix_precommit,
            app_id,
            app_installation_id,
            private_key,
            worker_id,
            branch_prefix: "claude/".to_string(),
            workspace_dir,
            subprocess_binary,
            mcp_server_name,
        })
    }

    pub fn owner_repo(&self) -> Result<(&str, &str), ConfigError> {
        self.repo
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidValue {
                var: "REPO",
                reason: "expected `owner/name`".to_string(),
            })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn optional_var(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_optional<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            var: name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn require_parsed<T>(name: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = require_var(name)?;
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        var: name,
        reason: e.to_string(),
    })
}

/// Only the literal string `"false"` disables a flag (spec.md §6).
fn parse_bool_flag(name: &'static str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => raw != "false",
        Err(_) => default,
    }
}

fn load_private_key_source() -> Result<PrivateKeySource, ConfigError> {
    let inline = std::env::var("APP_PRIVATE_KEY").ok();
    let path = std::env::var("APP_PRIVATE_KEY_PATH").ok();

    match (inline, path) {
        (Some(v), None) => Ok(PrivateKeySource::Inline(v)),
        (None, Some(p)) => Ok(PrivateKeySource::Path(p)),
        _ => Err(ConfigError::AmbiguousPrivateKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "REPO",
            "BRANCH",
            "TRIGGER_LABEL",
            "POLL_INTERVAL_SECONDS",
            "MAX_OPEN_CHANGESETS",
            "AUTO_FIX_CONFLICTS",
            "AUTO_FIX_GO_MOD",
            "AUTO_FIX_PRECOMMIT",
            "APP_ID",
            "APP_INSTALLATION_ID",
            "APP_PRIVATE_KEY",
            "APP_PRIVATE_KEY_PATH",
            "WORKER_ID",
            "WORKSPACE_DIR",
            "CODER_BINARY",
            "MCP_SERVER_NAME",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn missing_repo_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("APP_ID", "1");
        std::env::set_var("APP_INSTALLATION_ID", "2");
        std::env::set_var("APP_PRIVATE_KEY", "aGVsbG8=");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingVar("REPO"))
        ));
    }

    #[test]
    fn ambiguous_private_key_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("REPO", "acme/widgets");
        std::env::set_var("APP_ID", "1");
        std::env::set_var("APP_INSTALLATION_ID", "2");
        std::env::set_var("APP_PRIVATE_KEY", "aGVsbG8=");
        std::env::set_var("APP_PRIVATE_KEY_PATH", "/tmp/key.pem");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::AmbiguousPrivateKey)
        ));
    }

    #[test]
    fn defaults_apply() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("REPO", "acme/widgets");
        std::env::set_var("APP_ID", "1");
        std::env::set_var("APP_INSTALLATION_ID", "2");
        std::env::set_var("APP_PRIVATE_KEY", "aGVsbG8=");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.base_branch, "main");
        assert_eq!(cfg.trigger_label, "agent-ready");
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.max_open_change_sets, 3);
        assert!(cfg.auto_fix_conflicts);
    }

    #[test]
    fn explicit_false_disables_autofix() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("REPO", "acme/widgets");
        std::env::set_var("APP_ID", "1");
        std::env::set_var("APP_INSTALLATION_ID", "2");
        std::env::set_var("APP_PRIVATE_KEY", "aGVsbG8=");
        std::env::set_var("AUTO_FIX_CONFLICTS", "false");
        let cfg = Config::from_env().unwrap();
        assert!(!cfg.auto_fix_conflicts);
    }
}
