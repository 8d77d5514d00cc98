//! Configuration loading and management.
//!
//! Runtime configuration lives in `pinky.yaml` (path `$PINKY_CONFIG_PATH`
//! or `./pinky.yaml`). The inference lane file is separate (see
//! [`crate::inference::router`]) because the lane router rewrites it when
//! models change; everything else is owned by the human.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PinkyConfig {
    /// Channel adapter settings.
    pub channels: ChannelsConfig,
    /// Tool execution settings.
    pub tools: ToolsConfig,
    /// Approval gating settings.
    pub approvals: ApprovalsConfig,
    /// Identity persistence settings.
    pub identity: IdentityConfig,
    /// Filesystem paths.
    pub paths: PathsConfig,
}

/// Per-channel adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramChannelConfig,
    pub terminal: TerminalChannelConfig,
}

/// Telegram adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramChannelConfig {
    pub enabled: bool,
    /// Bot API token; a literal `"${NAME}"` resolves from the environment.
    pub bot_token: String,
    /// Long-poll timeout for `getUpdates`, in seconds.
    pub poll_timeout_seconds: u32,
}

impl Default for TelegramChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            poll_timeout_seconds: 30,
        }
    }
}

/// Terminal (stdin/stdout) adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalChannelConfig {
    pub enabled: bool,
}

impl Default for TerminalChannelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Tool execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Maximum concurrently running tool executions.
    pub max_concurrent: usize,
    /// Default per-execution timeout in seconds.
    pub default_timeout_secs: u64,
    /// Output cap in bytes; larger outputs are truncated.
    pub max_output_bytes: usize,
    pub shell: ShellToolConfig,
    pub git: GitToolConfig,
    pub web: WebToolConfig,
    pub api: ApiToolConfig,
    pub download: DownloadToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout_secs: 120,
            max_output_bytes: 1024 * 1024,
            shell: ShellToolConfig::default(),
            git: GitToolConfig::default(),
            web: WebToolConfig::default(),
            api: ApiToolConfig::default(),
            download: DownloadToolConfig::default(),
        }
    }
}

/// Shell tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellToolConfig {
    /// Shell binaries the tool may spawn.
    pub allowed_shells: Vec<String>,
}

impl Default for ShellToolConfig {
    fn default() -> Self {
        let allowed_shells = if cfg!(windows) {
            vec!["cmd".to_owned(), "powershell".to_owned()]
        } else {
            vec!["bash".to_owned(), "sh".to_owned()]
        };
        Self { allowed_shells }
    }
}

/// Git tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitToolConfig {
    /// Allow `git push` at all.
    pub allow_push: bool,
    /// Allow `git push --force` (requires `allow_push` too).
    pub allow_force_push: bool,
}

/// Web fetch tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebToolConfig {
    /// When non-empty, only these hosts may be fetched.
    pub allowed_hosts: Vec<String>,
    /// Hosts that are never fetched.
    pub blocked_hosts: Vec<String>,
    /// Response body cap in bytes.
    pub max_body_bytes: usize,
}

impl Default for WebToolConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
            max_body_bytes: 512 * 1024,
        }
    }
}

/// API tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToolConfig {
    /// When non-empty, only these domains may be called.
    pub allowed_domains: Vec<String>,
}

/// Download tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadToolConfig {
    /// Destination paths must fall under one of these directories.
    pub allowed_dirs: Vec<String>,
    /// Download size cap in bytes.
    pub max_bytes: u64,
}

impl Default for DownloadToolConfig {
    fn default() -> Self {
        Self {
            allowed_dirs: vec!["/tmp".to_owned()],
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Approval gating settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsConfig {
    /// Path of the per-user rules YAML file.
    pub path: String,
    /// How long an approval dialog waits before timing out, in seconds.
    pub timeout_secs: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            path: home_path("approvals.yaml"),
            timeout_secs: 300,
        }
    }
}

/// Identity persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path of the identity JSON snapshot.
    pub path: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: home_path("identity.json"),
        }
    }
}

/// Filesystem paths for logs and the lane file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
    /// Path of the inference lane YAML file.
    pub inference_config: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: home_path("logs"),
            inference_config: home_path("inference.yaml"),
        }
    }
}

/// Base directory for state files when the config does not pin one:
/// the platform data dir (e.g. `~/.local/share/pinky`), falling back to
/// the working directory.
pub fn default_home() -> PathBuf {
    directories::ProjectDirs::from("", "", "pinky")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn home_path(name: &str) -> String {
    default_home().join(name).display().to_string()
}

impl PinkyConfig {
    /// Load configuration with precedence: env vars > YAML file > defaults.
    ///
    /// Config file path: `$PINKY_CONFIG_PATH` or `./pinky.yaml`. A missing
    /// file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from the YAML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: PinkyConfig =
                    serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(PinkyConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("PINKY_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pinky.yaml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("PINKY_TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = env("PINKY_APPROVALS_PATH") {
            self.approvals.path = v;
        }
        if let Some(v) = env("PINKY_IDENTITY_PATH") {
            self.identity.path = v;
        }
        if let Some(v) = env("PINKY_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        if let Some(v) = env("PINKY_INFERENCE_CONFIG") {
            self.paths.inference_config = v;
        }
        if let Some(v) = env("PINKY_MAX_CONCURRENT_TOOLS") {
            match v.parse() {
                Ok(n) => self.tools.max_concurrent = n,
                Err(_) => tracing::warn!(
                    var = "PINKY_MAX_CONCURRENT_TOOLS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }
}

/// Resolve a configured secret value.
///
/// A literal `"${NAME}"` reads the `NAME` environment variable (empty when
/// unset); any other string is taken verbatim.
pub fn resolve_env_ref(value: &str) -> String {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return std::env::var(name).unwrap_or_default();
    }
    value.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = PinkyConfig::default();
        assert_eq!(config.tools.max_concurrent, 10);
        assert_eq!(config.tools.default_timeout_secs, 120);
        assert_eq!(config.tools.max_output_bytes, 1024 * 1024);
        assert_eq!(config.approvals.timeout_secs, 300);
    }

    #[test]
    fn shell_allowlist_is_platform_specific() {
        let config = ShellToolConfig::default();
        if cfg!(windows) {
            assert!(config.allowed_shells.contains(&"cmd".to_owned()));
        } else {
            assert!(config.allowed_shells.contains(&"bash".to_owned()));
            assert!(config.allowed_shells.contains(&"sh".to_owned()));
        }
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r"
tools:
  max_concurrent: 4
channels:
  telegram:
    enabled: true
    bot_token: ${TELEGRAM_TOKEN}
";
        let config: PinkyConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.tools.max_concurrent, 4);
        assert!(config.channels.telegram.enabled);
        assert_eq!(config.channels.telegram.bot_token, "${TELEGRAM_TOKEN}");
        // Untouched sections keep defaults.
        assert_eq!(config.approvals.timeout_secs, 300);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = PinkyConfig::default();
        config.apply_overrides(|key| match key {
            "PINKY_TELEGRAM_BOT_TOKEN" => Some("tok-123".to_owned()),
            "PINKY_MAX_CONCURRENT_TOOLS" => Some("3".to_owned()),
            _ => None,
        });
        assert_eq!(config.channels.telegram.bot_token, "tok-123");
        assert!(config.channels.telegram.enabled);
        assert_eq!(config.tools.max_concurrent, 3);
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut config = PinkyConfig::default();
        config.apply_overrides(|key| match key {
            "PINKY_MAX_CONCURRENT_TOOLS" => Some("lots".to_owned()),
            _ => None,
        });
        assert_eq!(config.tools.max_concurrent, 10);
    }

    #[test]
    fn env_ref_resolution() {
        assert_eq!(resolve_env_ref("literal-key"), "literal-key");
        // Unset variables resolve to empty rather than the placeholder.
        assert_eq!(resolve_env_ref("${PINKY_TEST_UNSET_VAR_XYZ}"), "");
    }
}
