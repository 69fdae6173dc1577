use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::upload::{MAX_STAGE_BLOCK_BYTES, MAX_UPLOAD_BLOB_BYTES};
use crate::{DEFAULT_PARALLELISM, Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Block/range size in bytes; 0 lets uploads pick one from the source size.
    pub block_size: u64,
    pub parallelism: u32,
    pub single_shot_max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreSettings {
    /// Root of the directory-backed object store; empty means "not configured".
    #[serde(default)]
    pub root: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            transfer: TransferSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            parallelism: DEFAULT_PARALLELISM as u32,
            single_shot_max_bytes: MAX_UPLOAD_BLOB_BYTES,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) | None => {
            let mut value = raw;
            if let Some(table) = value.as_table_mut() {
                table
                    .entry("version")
                    .or_insert(toml::Value::Integer(SETTINGS_SCHEMA_VERSION as i64));
            }
            Settings::deserialize(value)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    let t = &settings.transfer;
    if t.parallelism < 1 {
        return Err(Error::InvalidConfig {
            message: "transfer.parallelism must be >= 1".to_string(),
        });
    }
    if t.block_size > MAX_STAGE_BLOCK_BYTES {
        return Err(Error::InvalidConfig {
            message: format!("transfer.block_size must be <= {MAX_STAGE_BLOCK_BYTES}"),
        });
    }
    if t.single_shot_max_bytes == 0 || t.single_shot_max_bytes > MAX_UPLOAD_BLOB_BYTES {
        return Err(Error::InvalidConfig {
            message: format!(
                "transfer.single_shot_max_bytes must be within 1..={MAX_UPLOAD_BLOB_BYTES}"
            ),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
