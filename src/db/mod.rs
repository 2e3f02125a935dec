use crate::errors::{AppError, AppResult};
use crate::models::{AppState, SyncSettings, Theme, User, UserRole};
use crate::sanitize::{sanitize_app_state, with_defaults};
use chrono::Utc;
use once_cell::sync::Lazy;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const STORAGE_KEY: &str = "teamsync_data_v15";
pub const CURRENT_APP_VERSION: &str = "1.0.1";
const VERSION_SETTING_KEY: &str = "app_version";
const SYNC_SETTINGS_KEY: &str = "sync";

/// Emitted to subscribers when the document changes through another handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUpdate {
    pub key: String,
    pub last_updated: i64,
}

type StoreListener = Arc<dyn Fn(&StoreUpdate) + Send + Sync>;

struct RegisteredListener {
    id: u64,
    handle_id: u64,
    callback: StoreListener,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<RegisteredListener>>,
}

static LISTENER_REGISTRIES: Lazy<Mutex<HashMap<PathBuf, Weak<ListenerRegistry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn registry_for(path: &Path) -> Arc<ListenerRegistry> {
    let mut registries = LISTENER_REGISTRIES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    registries.retain(|_, registry| registry.strong_count() > 0);
    if let Some(existing) = registries.get(path).and_then(Weak::upgrade) {
        return existing;
    }
    let created = Arc::new(ListenerRegistry::default());
    registries.insert(path.to_path_buf(), Arc::downgrade(&created));
    created
}

/// Keeps a store listener registered until dropped.
pub struct StoreSubscription {
    registry: Weak<ListenerRegistry>,
    id: u64,
}

impl StoreSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut listeners = registry
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|listener| listener.id != self.id);
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    handle_id: u64,
    listeners: Arc<ListenerRegistry>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("db_path", &self.db_path)
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Store(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let db = Self {
            conn: Mutex::new(conn),
            listeners: registry_for(&db_path),
            db_path,
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    /// Returns the persisted document, or the bootstrap document when none
    /// exists, the stored data version differs, or the stored JSON is corrupt.
    pub fn load_state(&self) -> AppResult<AppState> {
        let conn = self.conn()?;
        let stored_version = read_setting(&conn, VERSION_SETTING_KEY)?;
        if stored_version.as_deref() != Some(CURRENT_APP_VERSION) {
            tracing::warn!(
                stored_version = stored_version.as_deref().unwrap_or("none"),
                current_version = CURRENT_APP_VERSION,
                "data version mismatch; purging local document"
            );
            purge_document(&conn)?;
            write_setting(&conn, VERSION_SETTING_KEY, CURRENT_APP_VERSION)?;
            return Ok(default_state(Utc::now().timestamp_millis()));
        }

        let raw = conn
            .query_row(
                "SELECT value_json FROM documents WHERE key = ?1",
                [STORAGE_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(default_state(Utc::now().timestamp_millis()));
        };

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => Ok(sanitize_app_state(value)),
            Err(error) => {
                tracing::error!(error = %error, "stored document is corrupt; purging local document");
                purge_document(&conn)?;
                Ok(default_state(Utc::now().timestamp_millis()))
            }
        }
    }

    /// Writes `state` under a freshly assigned `last_updated` that is strictly
    /// greater than both the stored clock and the clock `state` carries.
    pub fn save_state(&self, state: &AppState) -> AppResult<AppState> {
        let stamped = {
            let conn = self.conn()?;
            let previous: Option<i64> = conn
                .query_row(
                    "SELECT last_updated FROM documents WHERE key = ?1",
                    [STORAGE_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            let floor = previous.unwrap_or(0).max(state.last_updated);

            let mut stamped = state.clone();
            stamped.last_updated = Utc::now().timestamp_millis().max(floor + 1);
            write_document(&conn, &stamped)?;
            write_setting(&conn, VERSION_SETTING_KEY, CURRENT_APP_VERSION)?;
            stamped
        };

        self.notify_other_handles(stamped.last_updated);
        Ok(stamped)
    }

    /// Writes `state` keeping the `last_updated` it already carries.
    pub fn write_snapshot(&self, state: &AppState) -> AppResult<()> {
        {
            let conn = self.conn()?;
            write_document(&conn, state)?;
            write_setting(&conn, VERSION_SETTING_KEY, CURRENT_APP_VERSION)?;
        }
        self.notify_other_handles(state.last_updated);
        Ok(())
    }

    pub fn clear_state(&self) -> AppResult<()> {
        let conn = self.conn()?;
        purge_document(&conn)?;
        write_setting(&conn, VERSION_SETTING_KEY, CURRENT_APP_VERSION)?;
        Ok(())
    }

    /// Registers `callback` for writes made through any other handle opened on
    /// the same database file. Writes through this handle are not reported.
    pub fn subscribe_to_store_updates(
        &self,
        callback: impl Fn(&StoreUpdate) + Send + Sync + 'static,
    ) -> StoreSubscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .listeners
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.push(RegisteredListener {
            id,
            handle_id: self.handle_id,
            callback: Arc::new(callback),
        });

        StoreSubscription {
            registry: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub fn get_settings(&self) -> AppResult<SyncSettings> {
        let conn = self.conn()?;
        let raw = read_setting(&conn, SYNC_SETTINGS_KEY)?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<SyncSettings>(&raw).unwrap_or_default()),
            None => Ok(SyncSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<SyncSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: SyncSettings = serde_json::from_value(merged)?;

        let conn = self.conn()?;
        write_setting(&conn, SYNC_SETTINGS_KEY, &serde_json::to_string(&settings)?)?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SYNC_SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            write_setting(
                &conn,
                SYNC_SETTINGS_KEY,
                &serde_json::to_string(&SyncSettings::default())?,
            )?;
        }
        Ok(())
    }

    fn notify_other_handles(&self, last_updated: i64) {
        let callbacks = {
            let listeners = self
                .listeners
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .filter(|listener| listener.handle_id != self.handle_id)
                .map(|listener| listener.callback.clone())
                .collect::<Vec<_>>()
        };

        let update = StoreUpdate {
            key: STORAGE_KEY.to_string(),
            last_updated,
        };
        for callback in callbacks {
            callback(&update);
        }
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

/// The document a brand new installation starts from.
pub fn default_state(now_ms: i64) -> AppState {
    let admin = User {
        id: "u1".to_string(),
        uid: "Admin".to_string(),
        first_name: "System".to_string(),
        last_name: "Admin".to_string(),
        function_title: "System Administrator".to_string(),
        role: UserRole::Admin,
        manager_id: None,
        avatar_url: None,
        password: None,
        location: None,
        extra: Default::default(),
    };

    with_defaults(AppState {
        users: vec![admin],
        theme: Theme::Light,
        last_updated: now_ms,
        ..AppState::default()
    })
}

fn write_document(conn: &Connection, state: &AppState) -> AppResult<()> {
    conn.execute(
        "INSERT INTO documents (key, value_json, last_updated, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
           value_json = excluded.value_json,
           last_updated = excluded.last_updated,
           updated_at = excluded.updated_at",
        params![
            STORAGE_KEY,
            serde_json::to_string(state)?,
            state.last_updated,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

fn purge_document(conn: &Connection) -> AppResult<()> {
    conn.execute("DELETE FROM documents WHERE key = ?1", [STORAGE_KEY])?;
    Ok(())
}

fn read_setting(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(raw)
}

fn write_setting(conn: &Connection, key: &str, value: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
