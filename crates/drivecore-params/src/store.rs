//! SQLite-backed parameter store.
//!
//! Every value is an opaque byte blob keyed by one of the names registered in
//! [`keys`][crate::keys].  Typed helpers cover the encodings the stack uses:
//! ASCII booleans (`"1"` / `"0"`), UTF-8 strings and JSON documents.
//!
//! # Storage layout
//!
//! | column     | type | description                        |
//! |------------|------|------------------------------------|
//! | key        | TEXT | registered parameter name (PK)     |
//! | value      | BLOB | raw value bytes                    |
//! | updated_at | TEXT | RFC-3339 time of the last write    |
//!
//! # Example
//!
//! ```rust
//! use drivecore_params::{Params, keys};
//!
//! let params = Params::open_in_memory().unwrap();
//! params.put_bool(keys::MODELD_READY, true).unwrap();
//! assert!(params.get_bool(keys::MODELD_READY).unwrap());
//!
//! params.set_defaults().unwrap();
//! assert!(!params.exists(keys::MODELD_READY).unwrap());
//! ```

use std::path::Path;

use chrono::Utc;
use drivecore_types::DriveError;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::keys::{KEYS, ParamKeyType, key_type};

/// Errors that can arise from parameter store operations.
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Unknown param key: {0}")]
    UnknownKey(String),
    #[error("Param {key} holds malformed data: {details}")]
    Malformed { key: String, details: String },
}

impl From<ParamsError> for DriveError {
    fn from(e: ParamsError) -> Self {
        DriveError::Params(e.to_string())
    }
}

/// Shared handle to the key-value store.
///
/// The connection sits behind a mutex so one `Arc<Params>` can be handed to
/// every component.
pub struct Params {
    conn: Mutex<Connection>,
}

impl Params {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, ParamsError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ParamsError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS params (
                key        TEXT NOT NULL PRIMARY KEY,
                value      BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn check_key(key: &str) -> Result<ParamKeyType, ParamsError> {
        key_type(key).ok_or_else(|| ParamsError::UnknownKey(key.to_string()))
    }

    /// Delete every [`ParamKeyType::ClearOnStart`] key.
    pub fn set_defaults(&self) -> Result<(), ParamsError> {
        for (key, kind) in KEYS {
            if *kind == ParamKeyType::ClearOnStart {
                self.delete(key)?;
            }
        }
        debug!("clear-on-start params removed");
        Ok(())
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), ParamsError> {
        Self::check_key(key)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO params (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ParamsError> {
        Self::check_key(key)?;
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM params WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn exists(&self, key: &str) -> Result<bool, ParamsError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn delete(&self, key: &str) -> Result<(), ParamsError> {
        Self::check_key(key)?;
        self.conn
            .lock()
            .execute("DELETE FROM params WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn put_str(&self, key: &str, value: &str) -> Result<(), ParamsError> {
        self.put(key, value.as_bytes())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, ParamsError> {
        self.get(key)?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| ParamsError::Malformed {
                    key: key.to_string(),
                    details: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), ParamsError> {
        self.put(key, if value { b"1" } else { b"0" })
    }

    /// `true` only when the key exists and holds `"1"`.
    pub fn get_bool(&self, key: &str) -> Result<bool, ParamsError> {
        Ok(self.get(key)?.as_deref() == Some(b"1".as_slice()))
    }

    /// `true` when the key exists and its boolean value equals `value`.
    pub fn exists_and_compare(&self, key: &str, value: bool) -> Result<bool, ParamsError> {
        Ok(match self.get(key)? {
            Some(bytes) => (bytes.as_slice() == b"1") == value,
            None => false,
        })
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ParamsError> {
        let bytes = serde_json::to_vec(value).map_err(|e| ParamsError::Malformed {
            key: key.to_string(),
            details: e.to_string(),
        })?;
        self.put(key, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ParamsError> {
        self.get(key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| ParamsError::Malformed {
                    key: key.to_string(),
                    details: e.to_string(),
                })
            })
            .transpose()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[test]
    fn put_get_roundtrip_bytes() {
        let params = Params::open_in_memory().unwrap();
        params.put(keys::CAMERA_MATRIX, &[1, 2, 3]).unwrap();
        assert_eq!(params.get(keys::CAMERA_MATRIX).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_key_reads_as_none_and_false() {
        let params = Params::open_in_memory().unwrap();
        assert_eq!(params.get(keys::CALIBRATION_PARAMS).unwrap(), None);
        assert!(!params.get_bool(keys::MODELD_READY).unwrap());
        assert!(!params.exists_and_compare(keys::MODELD_READY, false).unwrap());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let params = Params::open_in_memory().unwrap();
        let err = params.put_bool("NotARealKey", true).unwrap_err();
        assert!(matches!(err, ParamsError::UnknownKey(k) if k == "NotARealKey"));
    }

    #[test]
    fn bool_encoding_and_compare() {
        let params = Params::open_in_memory().unwrap();
        params.put_bool(keys::MODELD_READY, false).unwrap();
        assert!(params.exists(keys::MODELD_READY).unwrap());
        assert!(!params.get_bool(keys::MODELD_READY).unwrap());
        assert!(params.exists_and_compare(keys::MODELD_READY, false).unwrap());
        params.put_bool(keys::MODELD_READY, true).unwrap();
        assert_eq!(params.get_string(keys::MODELD_READY).unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn set_defaults_clears_only_clear_on_start_keys() {
        let params = Params::open_in_memory().unwrap();
        params.put_bool(keys::MODELD_READY, true).unwrap();
        params.put_str(keys::DRIVECORE_PID, "4242").unwrap();
        params.put_bool(keys::FLOWINIT_READY, true).unwrap();
        params.put(keys::CALIBRATION_PARAMS, b"{}").unwrap();

        params.set_defaults().unwrap();

        assert!(!params.exists(keys::MODELD_READY).unwrap());
        assert!(!params.exists(keys::DRIVECORE_PID).unwrap());
        assert!(params.get_bool(keys::FLOWINIT_READY).unwrap());
        assert!(params.exists(keys::CALIBRATION_PARAMS).unwrap());
    }

    #[test]
    fn json_helpers_roundtrip_and_flag_garbage() {
        let params = Params::open_in_memory().unwrap();
        params.put_json(keys::DISTORTION_COEFFICIENTS, &vec![0.1f32, -0.2]).unwrap();
        let back: Option<Vec<f32>> = params.get_json(keys::DISTORTION_COEFFICIENTS).unwrap();
        assert_eq!(back, Some(vec![0.1, -0.2]));

        params.put(keys::DISTORTION_COEFFICIENTS, b"not json").unwrap();
        let err = params.get_json::<Vec<f32>>(keys::DISTORTION_COEFFICIENTS).unwrap_err();
        assert!(matches!(err, ParamsError::Malformed { .. }));
    }

    #[test]
    fn values_persist_across_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("params.db");
        {
            let params = Params::open(&path)?;
            params.put_bool(keys::FLOWINIT_READY, true)?;
        }
        let params = Params::open(&path)?;
        assert!(params.get_bool(keys::FLOWINIT_READY)?);
        Ok(())
    }

    #[test]
    fn params_error_maps_to_drive_error() {
        let err: DriveError = ParamsError::UnknownKey("X".into()).into();
        assert!(matches!(err, DriveError::Params(m) if m.contains('X')));
    }
}
