//! Engine configuration, driven by a declarative option schema.
//!
//! Every tunable is declared exactly once in [`SCHEMA`] with its key, value
//! kind and default; the same table backs the typed [`FetchConfig`], the
//! `key=value` text parser, and validation, so the three can never drift.

use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Stream-transport inactivity limit. Re-armed on every read or write that
/// makes progress; also the datagram payload-transfer inactivity limit.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;

/// Datagram manifest fetches are stateless on the peer side, so give up
/// much sooner than for payload transfers.
pub const DEFAULT_MANIFEST_IDLE_TIMEOUT_MS: u64 = 2_000;

/// Gap between payload block-request retransmissions.
/// 133 ms is roughly the time a full 32-block window (32 × 200 bytes ≈ 16KB)
/// takes on a 1 Mbit broadcast link, so re-asking sooner only wastes airtime.
pub const DEFAULT_BLOCK_TX_INTERVAL_MS: u64 = 133;

/// Gap between manifest-request retransmissions.
pub const DEFAULT_MANIFEST_TX_INTERVAL_MS: u64 = 100;

/// How long queued candidates settle before fetching begins.
/// Lets a full packet's worth of advertisements be queued and prioritised
/// before the first slot is committed.
pub const DEFAULT_ACTIVATION_DELAY_MS: u64 = 500;

/// Datagram block size. 200 bytes lets several blocks share a packet and
/// one fit into almost any outgoing packet that is not already full.
pub const DEFAULT_BLOCK_LEN: u16 = 200;

/// How long a bundle id stays suppressed after its manifest fails
/// verification.
pub const DEFAULT_IGNORE_TTL_MS: u64 = 60_000;

const DEFAULT_IMPORT_DIR: &str = "/tmp/rhizome/import";

// =============================================================================
// SCHEMA
// =============================================================================

/// Value kind of a configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Nonzero duration in milliseconds.
    Millis,
    /// Datagram block length in bytes, 16..=1400.
    BlockLen,
    /// Absolute filesystem path.
    Path,
}

/// One declared configuration option.
pub struct OptionDef {
    pub key: &'static str,
    pub kind: OptionKind,
    pub default: &'static str,
}

/// Every option the engine recognises.
pub const SCHEMA: &[OptionDef] = &[
    OptionDef { key: "rhizome.idle_timeout_ms", kind: OptionKind::Millis, default: "5000" },
    OptionDef { key: "rhizome.manifest_idle_timeout_ms", kind: OptionKind::Millis, default: "2000" },
    OptionDef { key: "rhizome.block_tx_interval_ms", kind: OptionKind::Millis, default: "133" },
    OptionDef { key: "rhizome.manifest_tx_interval_ms", kind: OptionKind::Millis, default: "100" },
    OptionDef { key: "rhizome.activation_delay_ms", kind: OptionKind::Millis, default: "500" },
    OptionDef { key: "rhizome.default_block_len", kind: OptionKind::BlockLen, default: "200" },
    OptionDef { key: "rhizome.import_dir", kind: OptionKind::Path, default: DEFAULT_IMPORT_DIR },
    OptionDef { key: "rhizome.ignore_ttl_ms", kind: OptionKind::Millis, default: "60000" },
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("malformed configuration line {0}: expected key=value")]
    MalformedLine(usize),
}

// =============================================================================
// TYPED CONFIGURATION
// =============================================================================

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub idle_timeout_ms: u64,
    pub manifest_idle_timeout_ms: u64,
    pub block_tx_interval_ms: u64,
    pub manifest_tx_interval_ms: u64,
    pub activation_delay_ms: u64,
    pub default_block_len: u16,
    pub import_dir: PathBuf,
    pub ignore_ttl_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            manifest_idle_timeout_ms: DEFAULT_MANIFEST_IDLE_TIMEOUT_MS,
            block_tx_interval_ms: DEFAULT_BLOCK_TX_INTERVAL_MS,
            manifest_tx_interval_ms: DEFAULT_MANIFEST_TX_INTERVAL_MS,
            activation_delay_ms: DEFAULT_ACTIVATION_DELAY_MS,
            default_block_len: DEFAULT_BLOCK_LEN,
            import_dir: PathBuf::from(DEFAULT_IMPORT_DIR),
            ignore_ttl_ms: DEFAULT_IGNORE_TTL_MS,
        }
    }
}

impl FetchConfig {
    /// Parse a configuration text of `key=value` lines.
    ///
    /// Blank lines and `#` comments are skipped. Unknown keys and malformed
    /// values are errors naming the offending key; options left unset keep
    /// their schema defaults.
    pub fn from_text(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine(idx + 1));
            };
            cfg.set(key.trim(), value.trim())?;
        }
        Ok(cfg)
    }

    /// Apply a single option by key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let def = SCHEMA
            .iter()
            .find(|d| d.key == key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        match def.kind {
            OptionKind::Millis => {
                let ms = parse_millis(key, value)?;
                match key {
                    "rhizome.idle_timeout_ms" => self.idle_timeout_ms = ms,
                    "rhizome.manifest_idle_timeout_ms" => self.manifest_idle_timeout_ms = ms,
                    "rhizome.block_tx_interval_ms" => self.block_tx_interval_ms = ms,
                    "rhizome.manifest_tx_interval_ms" => self.manifest_tx_interval_ms = ms,
                    "rhizome.activation_delay_ms" => self.activation_delay_ms = ms,
                    "rhizome.ignore_ttl_ms" => self.ignore_ttl_ms = ms,
                    _ => unreachable!("schema kind/key mismatch"),
                }
            }
            OptionKind::BlockLen => {
                let len: u16 = value.parse().map_err(|_| invalid(key, "not a number"))?;
                if !(16..=1400).contains(&len) {
                    return Err(invalid(key, "block length must be in 16..=1400"));
                }
                self.default_block_len = len;
            }
            OptionKind::Path => {
                let path = PathBuf::from(value);
                if !path.is_absolute() {
                    return Err(invalid(key, "path must be absolute"));
                }
                self.import_dir = path;
            }
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    let ms: u64 = value.parse().map_err(|_| invalid(key, "not a number"))?;
    if ms == 0 {
        return Err(invalid(key, "must be nonzero"));
    }
    Ok(ms)
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), reason: reason.to_string() }
}
