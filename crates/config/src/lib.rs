//! Layered configuration for cirrus.
//!
//! Values are resolved in order: built-in defaults, then an optional file
//! (TOML, YAML or JSON, chosen by extension), then `CIRRUS_` environment
//! variables where `__` separates nesting levels (`CIRRUS_CHUNK__SIZE=131072`).

pub mod error;

use crate::error::{ErrorKind, Result};
use cirrus_compress::Compression;
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: u64 = 8192;
pub const DEFAULT_CHUNK_SIZE: u64 = 65536;
pub const DEFAULT_PARALLEL_TRANSFERS: usize = 4;

const ENV_PREFIX: &str = "CIRRUS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunk: ChunkSettings,
    pub transfers: TransferSettings,
    pub storage: StorageSettings,
    pub paths: PathSettings,
    /// Credentials for an S3-compatible drive, when one is configured.
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(with = "compression_name")]
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub parallel: usize,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub sync_interval_secs: u64,
    pub clear_cache_on_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
    /// Advertised capacity in bytes.
    pub quota: u64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            compressed: false,
            encrypted: false,
            compression: Compression::Gzip,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self { parallel: DEFAULT_PARALLEL_TRANSFERS, sweep_interval_ms: 1000 }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { sync_interval_secs: 30, clear_cache_on_exit: false }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        let (data_dir, cache_dir) = match ProjectDirs::from("", "", "cirrus") {
            Some(dirs) => (dirs.data_dir().to_path_buf(), dirs.cache_dir().to_path_buf()),
            // No home directory (containers, service accounts).
            None => {
                let base = std::env::temp_dir().join("cirrus");
                (base.join("data"), base.join("cache"))
            },
        };
        let database = data_dir.join("cirrus.db");
        Self { data_dir, cache_dir, database }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk: ChunkSettings::default(),
            transfers: TransferSettings::default(),
            storage: StorageSettings::default(),
            paths: PathSettings::default(),
            s3: None,
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    #[tracing::instrument(level = "debug")]
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(file) = file {
            figment = merge_file(figment, file)?;
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate settings from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment.extract().or_raise(|| ErrorKind::Load)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk.size < MIN_CHUNK_SIZE {
            exn::bail!(ErrorKind::Invalid(format!(
                "chunk.size must be at least {MIN_CHUNK_SIZE}, got {}",
                self.chunk.size
            )));
        }
        if self.transfers.parallel == 0 {
            exn::bail!(ErrorKind::Invalid("transfers.parallel must be at least 1".to_string()));
        }
        if self.transfers.sweep_interval_ms == 0 {
            exn::bail!(ErrorKind::Invalid("transfers.sweep_interval_ms must be non-zero".to_string()));
        }
        if self.storage.sync_interval_secs == 0 {
            exn::bail!(ErrorKind::Invalid("storage.sync_interval_secs must be non-zero".to_string()));
        }
        if let Some(s3) = &self.s3
            && s3.bucket.trim().is_empty()
        {
            exn::bail!(ErrorKind::Invalid("s3.bucket must not be empty".to_string()));
        }
        if let Some(s3) = &self.s3
            && s3.quota > i64::MAX as u64
        {
            exn::bail!(ErrorKind::Invalid(format!("s3.quota must be at most {}", i64::MAX)));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.transfers.sweep_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.storage.sync_interval_secs)
    }
}

fn merge_file(figment: Figment, file: &Path) -> Result<Figment> {
    let extension = file.extension().and_then(|ext| ext.to_str()).unwrap_or_default().to_lowercase();
    Ok(match extension.as_str() {
        "toml" => figment.merge(Toml::file(file)),
        "yaml" | "yml" => figment.merge(Yaml::file(file)),
        "json" => figment.merge(Json::file(file)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(file.display().to_string())),
    })
}

mod compression_name {
    use cirrus_compress::Compression;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Compression, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Compression, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(|err: cirrus_compress::error::Error| D::Error::custom(err.to_string()))
    }
}
