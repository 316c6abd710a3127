use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [sync]
//                    stale_threshold_ms = 5000
//
//   env var:         SLATE_SYNC__STALE_THRESHOLD_MS=5000   (double underscore = nesting)
//
//   (single underscore stays within field names: SLATE_BACKPLANE__SERVER_ID)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub backplane: BackplaneFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Listener knobs (lives under `[server]` in config.toml).
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

/// Relay tuning knobs (lives under `[sync]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    /// High-frequency envelopes older than this are discarded at admission.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: i64,
    /// Per-subscriber outbound queue depth before backpressure kicks in.
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Cross-process fan-out knobs (lives under `[backplane]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackplaneFileConfig {
    /// When false the server runs single-process with an in-memory bus.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backplane_url")]
    pub url: String,
    /// Stable identity for this process on the backplane. Defaults to a
    /// fresh UUID per boot, which is what the echo-suppression needs; set
    /// it only when logs from a fleet should be correlatable.
    #[serde(default)]
    pub server_id: Option<String>,
}

impl Default for BackplaneFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_backplane_url(),
            server_id: None,
        }
    }
}

/// Built-in auth table (lives under `[auth]` in config.toml).
///
/// Deployments with a real identity backend implement the auth service
/// trait and ignore this section entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Accept any credential as its own principal id. When false, every
    /// connection is refused until a custom auth service is wired in.
    #[serde(default = "default_auth_open")]
    pub open: bool,
    /// Role granted to every principal in open mode.
    #[serde(default = "default_auth_role")]
    pub role: slate_protocol::Role,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            open: default_auth_open(),
            role: default_auth_role(),
        }
    }
}

fn default_auth_open() -> bool {
    true
}
fn default_auth_role() -> slate_protocol::Role {
    slate_protocol::Role::Owner
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4600
}
fn default_stale_threshold_ms() -> i64 {
    slate_protocol::DEFAULT_SERVER_STALE_MS
}
fn default_send_channel_capacity() -> usize {
    64
}
fn default_backplane_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Build a figment that layers: defaults → config.toml → SLATE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SLATE_SERVER__PORT=4601`  →  `server.port = 4601`
///   `SLATE_BACKPLANE__ENABLED=true`  →  `backplane.enabled = true`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("SLATE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Admission cutoff for high-frequency envelope age.
    pub stale_threshold: Duration,
    /// Same cutoff in milliseconds, for timestamp arithmetic.
    pub stale_threshold_ms: i64,
    /// Per-subscriber outbound mpsc depth.
    pub send_channel_capacity: usize,
}

impl SyncConfig {
    pub fn from_file(fc: &SyncFileConfig) -> Self {
        let ms = fc.stale_threshold_ms.max(0);
        Self {
            stale_threshold: Duration::from_millis(ms as u64),
            stale_threshold_ms: ms,
            send_channel_capacity: fc.send_channel_capacity.max(1),
        }
    }
}

/// Backplane configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BackplaneConfig {
    pub enabled: bool,
    pub url: String,
    pub server_id: String,
}

impl BackplaneConfig {
    pub fn from_file(fc: &BackplaneFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            url: fc.url.clone(),
            server_id: fc
                .server_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// Resolve the listen address from the file config.
pub fn bind_addr(fc: &ServerFileConfig) -> Result<SocketAddr, std::net::AddrParseError> {
    let ip: IpAddr = fc.host.parse()?;
    Ok(SocketAddr::new(ip, fc.port))
}
