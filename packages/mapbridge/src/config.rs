use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [storage]
//                    max_project_size_mb = 250
//
//   env var:         MAPBRIDGE_STORAGE__MAX_PROJECT_SIZE_MB=250   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
    #[serde(default)]
    pub upload: UploadFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Project storage (lives under `[storage]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageFileConfig {
    /// Root of per-user project directories. Defaults to `<data_dir>/projects`.
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
    #[serde(default = "default_max_project_size_mb")]
    pub max_project_size_mb: u64,
}

impl Default for StorageFileConfig {
    fn default() -> Self {
        Self {
            projects_dir: None,
            max_project_size_mb: default_max_project_size_mb(),
        }
    }
}

/// Upload progress tunables (lives under `[upload]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadFileConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_progress_step_kb")]
    pub progress_step_kb: u64,
}

impl Default for UploadFileConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            progress_step_kb: default_progress_step_kb(),
        }
    }
}

/// Auth tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// One `[[auth.users]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub superuser: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_max_project_size_mb() -> u64 {
    100
}
fn default_progress_interval_ms() -> u64 {
    500
}
fn default_progress_step_kb() -> u64 {
    32
}

/// Build a figment that layers: defaults → config.toml → MAPBRIDGE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MAPBRIDGE_SERVER__PORT=9000`  →  `server.port = 9000`
///   `MAPBRIDGE_AUTH__ENABLED=true`  →  `auth.enabled = true`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("MAPBRIDGE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Storage configuration (runtime view).
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub projects_dir: PathBuf,
    /// Quota ceiling for non-superusers, in bytes
    pub max_project_size: u64,
}

impl StorageConfig {
    pub fn from_file(fc: &StorageFileConfig, data_dir: &Path) -> Self {
        Self {
            projects_dir: fc
                .projects_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("projects")),
            max_project_size: fc.max_project_size_mb * 1024 * 1024,
        }
    }
}

/// Upload configuration (runtime view).
#[derive(Clone, Debug)]
pub struct UploadConfig {
    /// Minimum spacing between progress notifications
    pub progress_interval: Duration,
    /// Bytes between progress callbacks for one file
    pub progress_step: u64,
}

impl UploadConfig {
    pub fn from_file(fc: &UploadFileConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(fc.progress_interval_ms),
            progress_step: fc.progress_step_kb.max(1) * 1024,
        }
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// When false, the caller's identity is taken from a header/query parameter
    pub enabled: bool,
    pub users: Vec<UserEntry>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            users: fc.users.clone(),
        }
    }

    pub fn find_by_token(&self, token: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| u.token == token)
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not read through figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct MapbridgeConfig {
    pub data_dir: PathBuf,
}

impl MapbridgeConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".mapbridge"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
