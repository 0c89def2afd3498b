//! SQLite-backed weather cache with per-key change notification.
//!
//! One row per lookup key. Writes replace on conflict, and every observer of
//! a key is pushed the new value after a write that changes it.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use weatherez_core::{DatabaseError, RusqliteErrorExt};

use crate::types::WeatherRecord;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, DatabaseError>;

/// Persistent single-row-per-key weather storage.
pub trait WeatherStore: Send + Sync {
    /// Subscribe to the value stored under `key`.
    ///
    /// The subscription yields the current value first, then every change.
    fn observe(&self, key: &str) -> StoreResult<RecordSubscription>;

    /// Insert or replace the record with the same key.
    fn upsert(&self, record: &WeatherRecord) -> StoreResult<()>;

    /// Remove the record for `key`. No-op if absent.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// One-shot read of the record for `key`.
    fn get(&self, key: &str) -> StoreResult<Option<WeatherRecord>>;
}

/// Live view of one key in a [`WeatherStore`].
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct RecordSubscription {
    rx: watch::Receiver<Option<WeatherRecord>>,
    primed: bool,
}

impl RecordSubscription {
    pub fn new(rx: watch::Receiver<Option<WeatherRecord>>) -> Self {
        Self { rx, primed: false }
    }

    /// Wait for the next stored value.
    ///
    /// The first call returns immediately with the current value. Returns
    /// `None` once the store has gone away.
    pub async fn next(&mut self) -> Option<Option<WeatherRecord>> {
        if self.primed {
            self.rx.changed().await.ok()?;
        }
        self.primed = true;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// SQLite implementation of [`WeatherStore`].
pub struct SqliteWeatherStore {
    conn: Mutex<Connection>,
    watchers: Mutex<HashMap<String, watch::Sender<Option<WeatherRecord>>>>,
}

impl SqliteWeatherStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            watchers: Mutex::new(HashMap::new()),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS weather (
                    city TEXT PRIMARY KEY,
                    temperature REAL NOT NULL,
                    humidity INTEGER NOT NULL,
                    condition TEXT NOT NULL,
                    icon TEXT NOT NULL,
                    last_updated INTEGER NOT NULL
                );
                "#,
            )
            .map_err(RusqliteErrorExt::into_database_error)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<WeatherRecord> {
        Ok(WeatherRecord {
            key: row.get(0)?,
            temperature: row.get(1)?,
            humidity: row.get(2)?,
            condition: row.get(3)?,
            icon: row.get(4)?,
            last_updated: row.get(5)?,
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM weather", [], |row| row.get(0))
            .map_err(RusqliteErrorExt::into_database_error)?;
        usize::try_from(count)
            .map_err(|_| DatabaseError::Corruption(format!("negative row count {}", count)))
    }

    fn notify(&self, key: &str, value: Option<WeatherRecord>) {
        let watchers = self.watchers.lock();
        if let Some(tx) = watchers.get(key) {
            tx.send_if_modified(|current| {
                if *current == value {
                    false
                } else {
                    *current = value;
                    true
                }
            });
        }
    }
}

impl WeatherStore for SqliteWeatherStore {
    fn observe(&self, key: &str) -> StoreResult<RecordSubscription> {
        let mut watchers = self.watchers.lock();
        watchers.retain(|_, tx| tx.receiver_count() > 0);

        if let Some(tx) = watchers.get(key) {
            return Ok(RecordSubscription::new(tx.subscribe()));
        }

        let current = self.get(key)?;
        let (tx, rx) = watch::channel(current);
        watchers.insert(key.to_string(), tx);
        tracing::debug!("Observing weather for {}", key);
        Ok(RecordSubscription::new(rx))
    }

    fn upsert(&self, record: &WeatherRecord) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT OR REPLACE INTO weather
                (city, temperature, humidity, condition, icon, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.key,
                    record.temperature,
                    record.humidity,
                    record.condition,
                    record.icon,
                    record.last_updated,
                ],
            )
            .map_err(RusqliteErrorExt::into_database_error)?;

        tracing::debug!("Stored weather for {}", record.key);
        self.notify(&record.key, Some(record.clone()));
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM weather WHERE city = ?1", params![key])
            .map_err(RusqliteErrorExt::into_database_error)?;

        if removed > 0 {
            tracing::debug!("Deleted weather for {}", key);
            self.notify(key, None);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<WeatherRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT city, temperature, humidity, condition, icon, last_updated
                 FROM weather WHERE city = ?1",
                params![key],
                Self::row_to_record,
            )
            .optional()
            .map_err(RusqliteErrorExt::into_database_error)
    }
}
