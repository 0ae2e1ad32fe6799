use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::KeyValuePersistence;

const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

/// Thread-safe handle to the embedded state database.
#[derive(Clone)]
pub struct StateDb {
    db: Arc<Database>,
}

impl StateDb {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure the table exists so read transactions never miss it.
        let write_txn = db.begin_write()?;
        write_txn.open_table(STATE)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// A typed view of one row.
    pub fn cell<T>(&self, name: &str) -> RedbCell<T> {
        RedbCell {
            db: self.db.clone(),
            name: name.to_owned(),
            _marker: PhantomData,
        }
    }

    /// Names of every stored row.
    pub fn names(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE)?;
        let mut names = Vec::new();
        for item in table.iter()? {
            let (k, _v) = item?;
            names.push(k.value().to_owned());
        }
        Ok(names)
    }
}

/// One bincode-encoded value stored under a fixed name.
pub struct RedbCell<T> {
    db: Arc<Database>,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> KeyValuePersistence<T> for RedbCell<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE)?;
        let Some(guard) = table.get(self.name.as_str())? else {
            return Ok(None);
        };
        let (value, _): (T, _) =
            bincode::serde::decode_from_slice(guard.value(), bincode::config::standard())
                .with_context(|| format!("bincode decode {}", self.name))?;
        Ok(Some(value))
    }

    fn save(&self, value: &T) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .with_context(|| format!("bincode encode {}", self.name))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE)?;
            table.insert(self.name.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(name = %self.name, "stored state value");
        Ok(())
    }
}
