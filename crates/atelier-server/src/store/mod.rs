pub mod db;
pub mod file;
pub mod magic;
pub mod model;
pub mod token;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

pub use db::{RedbCell, StateDb};
pub use file::JsonFile;
pub use magic::MagicLinkStore;
pub use model::{AccessToken, MagicLinks, OtpChannelStatus};
pub use token::TokenStore;

/// Load/save contract for a single persisted value.
///
/// The gate only ever talks to this trait, so the flat JSON files can be
/// swapped for the embedded database without touching auth logic.
pub trait KeyValuePersistence<T>: Send + Sync {
    /// Returns `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<T>>;
    fn save(&self, value: &T) -> Result<()>;
}

/// Which backend holds the gate's small state values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateBackend {
    #[default]
    Json,
    Redb,
}

impl StateBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "file" => Some(Self::Json),
            "redb" | "db" => Some(Self::Redb),
            _ => None,
        }
    }
}

pub const TOKEN_KEY: &str = "admin_tokens";
pub const MAGIC_KEY: &str = "admin_magic";
pub const OTP_STATUS_KEY: &str = "otp_status";

/// Opens named cells on whichever backend was configured.
#[derive(Clone)]
pub enum StateLocation {
    Files(std::path::PathBuf),
    Db(StateDb),
}

impl StateLocation {
    pub fn open(backend: StateBackend, data_dir: &Path) -> Result<Self> {
        match backend {
            StateBackend::Json => Ok(Self::Files(data_dir.to_path_buf())),
            StateBackend::Redb => Ok(Self::Db(StateDb::open(&data_dir.join("state.redb"))?)),
        }
    }

    pub fn cell<T>(&self, name: &str) -> Arc<dyn KeyValuePersistence<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        match self {
            Self::Files(dir) => Arc::new(JsonFile::new(dir.join(format!("{name}.json")))),
            Self::Db(db) => Arc::new(db.cell(name)),
        }
    }
}
