pub mod memory;
pub mod redis;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, ThrottlerError};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::sqlite::SqliteStore;

/// Uniform single-key access to a backing table.
pub trait KvStore: Send + Sync {
    /// Name of the table (or hash) holding the rows.
    fn table(&self) -> &str;

    /// Short backend label for logs and health output.
    fn backend(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes the key, returning whether a row existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Writes `value` only if the stored value equals `expected`.
    ///
    /// `expected == None` means the key must be absent. Returns whether the
    /// write happened.
    fn compare_and_set(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool>;

    fn ping(&self) -> Result<()>;
}

/// Parsed store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    Memory,
    Sqlite(PathBuf),
    Redis(String),
}

impl FromStr for StoreUri {
    type Err = ThrottlerError;

    fn from_str(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        if uri == "memory:" || uri == "memory://" {
            return Ok(StoreUri::Memory);
        }

        if uri.starts_with("redis://") || uri.starts_with("rediss://") {
            return Ok(StoreUri::Redis(uri.to_string()));
        }

        if let Some(rest) = uri.strip_prefix("sqlite:") {
            // sqlite:///abs/path keeps the leading slash, sqlite://rel/path does not.
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(ThrottlerError::InvalidStoreUri(format!(
                    "'{}' does not name a database file",
                    uri
                )));
            }
            return Ok(StoreUri::Sqlite(PathBuf::from(path)));
        }

        Err(ThrottlerError::InvalidStoreUri(format!(
            "'{}' must start with sqlite:, redis://, rediss:// or memory:",
            uri
        )))
    }
}

impl fmt::Display for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreUri::Memory => write!(f, "memory:"),
            StoreUri::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
            StoreUri::Redis(url) => write!(f, "{}", url),
        }
    }
}

/// Opens the backend named by `uri`, provisioning `table` if it does not exist.
pub fn open_store(uri: &StoreUri, table: &str) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match uri {
        StoreUri::Memory => Arc::new(MemoryStore::new(table)),
        StoreUri::Sqlite(path) => Arc::new(SqliteStore::open(path, table)?),
        StoreUri::Redis(url) => Arc::new(RedisStore::open(url, table)?),
    };

    tracing::info!(
        backend = store.backend(),
        table = store.table(),
        uri = %uri,
        "Opened quota store"
    );

    Ok(store)
}
