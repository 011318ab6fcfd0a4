//! `SQLite`-backed ledger store implementation.
//!
//! This module uses `SQLite` with WAL mode for the underlying storage. The
//! [`SqliteLedgerStore`] struct implements the [`LedgerStore`] trait. SQLite's
//! single-writer serialization provides the atomic conditional-write
//! primitive: the key-absent precondition compiles to a plain `INSERT`
//! guarded by the primary key, and field-equals preconditions compile to
//! `UPDATE ... WHERE <expected fields>` with an affected-row-count check.

// SQLite returns i64 for integer columns; workflow ids and fingerprints are
// stored by bit pattern. Mutex poisoning indicates a panic in another
// thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};

use crate::record::{
    CounterRecord, CounterState, LockStatus, RequestRecord, RequestType, WorkflowStatus,
};

use super::{LedgerStore, Page, PageToken, StoreError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const REQUEST_COLUMNS: &str = "device_key, workflow_id, device_scope, mitigation_name, \
     mitigation_template, service_name, mitigation_version, request_type, workflow_status, \
     update_workflow_id, definition_payload, definition_fingerprint, locations, \
     request_date_ns, requested_by, defunct";

/// The conditional-write ledger table backed by `SQLite`.
///
/// The connection lives behind an `Arc<Mutex<_>>`; cloning the store shares
/// the connection, which is how concurrent caller threads race against one
/// table in tests and in single-process deployments.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl SqliteLedgerStore {
    /// Opens or creates a ledger store at the specified path.
    ///
    /// If the database doesn't exist, it will be created with the
    /// appropriate schema. WAL mode is enabled for concurrent reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(classify)?;

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Initialize the connection with schema and pragmas.
    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(classify)?;
        Ok(())
    }
}

/// Maps a rusqlite error into the store taxonomy: busy/locked is the
/// transient class, everything else is a fatal database error.
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Unavailable {
                reason: message
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", failure.code)),
            }
        }
        _ => StoreError::Database(err),
    }
}

/// Raw column values of one request row, decoded into the domain type in a
/// second step so enum parse failures become `CorruptRow` instead of being
/// squeezed through rusqlite's error type.
struct RawRequestRow {
    device_key: String,
    workflow_id: i64,
    device_scope: String,
    mitigation_name: String,
    mitigation_template: String,
    service_name: String,
    mitigation_version: i64,
    request_type: String,
    workflow_status: String,
    update_workflow_id: i64,
    definition_payload: Vec<u8>,
    definition_fingerprint: i64,
    locations: String,
    request_date_ns: i64,
    requested_by: String,
    defunct: i64,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRequestRow> {
    Ok(RawRequestRow {
        device_key: row.get(0)?,
        workflow_id: row.get(1)?,
        device_scope: row.get(2)?,
        mitigation_name: row.get(3)?,
        mitigation_template: row.get(4)?,
        service_name: row.get(5)?,
        mitigation_version: row.get(6)?,
        request_type: row.get(7)?,
        workflow_status: row.get(8)?,
        update_workflow_id: row.get(9)?,
        definition_payload: row.get(10)?,
        definition_fingerprint: row.get(11)?,
        locations: row.get(12)?,
        request_date_ns: row.get(13)?,
        requested_by: row.get(14)?,
        defunct: row.get(15)?,
    })
}

fn decode(raw: RawRequestRow) -> Result<RequestRecord, StoreError> {
    let corrupt = |details: String| StoreError::CorruptRow {
        device_key: raw.device_key.clone(),
        workflow_id: raw.workflow_id as u64,
        details,
    };

    let request_type =
        RequestType::parse(&raw.request_type).map_err(|e| corrupt(e.to_string()))?;
    let workflow_status =
        WorkflowStatus::parse(&raw.workflow_status).map_err(|e| corrupt(e.to_string()))?;
    let locations: BTreeSet<String> =
        serde_json::from_str(&raw.locations).map_err(|e| corrupt(format!("locations: {e}")))?;

    Ok(RequestRecord {
        device_key: raw.device_key.clone(),
        workflow_id: raw.workflow_id as u64,
        device_scope: raw.device_scope,
        mitigation_name: raw.mitigation_name,
        mitigation_template: raw.mitigation_template,
        service_name: raw.service_name,
        mitigation_version: raw.mitigation_version as u32,
        request_type,
        workflow_status,
        update_workflow_id: raw.update_workflow_id as u64,
        definition_payload: raw.definition_payload,
        definition_fingerprint: raw.definition_fingerprint as u64,
        locations,
        request_date: DateTime::from_timestamp_nanos(raw.request_date_ns),
        requested_by: raw.requested_by,
        defunct: raw.defunct != 0,
    })
}

fn encode_locations(locations: &BTreeSet<String>) -> Result<String, StoreError> {
    serde_json::to_string(locations).map_err(|e| StoreError::Unavailable {
        reason: format!("failed to encode locations: {e}"),
    })
}

impl LedgerStore for SqliteLedgerStore {
    fn get_request(
        &self,
        device_key: &str,
        workflow_id: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let raw = conn
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM mitigation_requests \
                     WHERE device_key = ?1 AND workflow_id = ?2"
                ),
                params![device_key, workflow_id as i64],
                read_raw,
            )
            .optional()
            .map_err(classify)?;

        raw.map(decode).transpose()
    }

    fn put_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let locations = encode_locations(&record.locations)?;
        let conn = self.conn.lock().unwrap();

        let result = conn.execute(
            "INSERT INTO mitigation_requests (device_key, workflow_id, device_scope, \
             mitigation_name, mitigation_template, service_name, mitigation_version, \
             request_type, workflow_status, update_workflow_id, definition_payload, \
             definition_fingerprint, locations, request_date_ns, requested_by, defunct) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.device_key,
                record.workflow_id as i64,
                record.device_scope,
                record.mitigation_name,
                record.mitigation_template,
                record.service_name,
                i64::from(record.mitigation_version),
                record.request_type.as_str(),
                record.workflow_status.as_str(),
                record.update_workflow_id as i64,
                record.definition_payload,
                record.definition_fingerprint as i64,
                locations,
                record.request_date.timestamp_nanos_opt().unwrap_or(0),
                record.requested_by,
                i64::from(record.defunct),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::PreconditionFailed {
                    context: "request key must not exist",
                })
            }
            Err(other) => Err(classify(other)),
        }
    }

    fn max_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
        at_or_above: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let floor = at_or_above.map_or(Value::Null, |f| Value::Integer(f as i64));
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(workflow_id) FROM mitigation_requests \
                 WHERE device_key = ?1 AND device_scope = ?2 \
                 AND (?3 IS NULL OR workflow_id >= ?3)",
                params![device_key, scope, floor],
                |row| row.get(0),
            )
            .map_err(classify)?;

        Ok(max.map(|m| m as u64))
    }

    fn active_heads(
        &self,
        device_key: &str,
        min_workflow_id: u64,
        page: Option<PageToken>,
        page_size: usize,
    ) -> Result<Page<RequestRecord>, StoreError> {
        let floor = page.map_or(min_workflow_id, |t| t.0.max(min_workflow_id));
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM mitigation_requests \
                 WHERE device_key = ?1 AND update_workflow_id = 0 AND defunct = 0 \
                 AND request_type != 'DELETE' \
                 AND workflow_status NOT IN ('FAILED', 'INDETERMINATE') \
                 AND workflow_id >= ?2 \
                 ORDER BY workflow_id ASC \
                 LIMIT ?3"
            ))
            .map_err(classify)?;

        // Fetch one extra row to decide whether a continuation is needed.
        let raw_rows = stmt
            .query_map(
                params![device_key, floor as i64, (page_size + 1) as i64],
                read_raw,
            )
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        let mut rows = raw_rows
            .into_iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;

        let next = if rows.len() > page_size {
            let boundary = rows[page_size].workflow_id;
            rows.truncate(page_size);
            Some(PageToken(boundary))
        } else {
            None
        };

        Ok(Page { rows, next })
    }

    fn latest_for_name(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let raw = conn
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM mitigation_requests \
                     WHERE device_key = ?1 AND device_scope = ?2 \
                     AND mitigation_name = ?3 AND defunct = 0 \
                     ORDER BY workflow_id DESC LIMIT 1"
                ),
                params![device_key, scope, mitigation_name],
                read_raw,
            )
            .optional()
            .map_err(classify)?;

        raw.map(decode).transpose()
    }

    fn record_for_version(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
        mitigation_version: u32,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let raw = conn
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM mitigation_requests \
                     WHERE device_key = ?1 AND device_scope = ?2 \
                     AND mitigation_name = ?3 AND mitigation_version = ?4 AND defunct = 0 \
                     ORDER BY workflow_id DESC LIMIT 1"
                ),
                params![
                    device_key,
                    scope,
                    mitigation_name,
                    i64::from(mitigation_version)
                ],
                read_raw,
            )
            .optional()
            .map_err(classify)?;

        raw.map(decode).transpose()
    }

    fn mark_superseded(
        &self,
        device_key: &str,
        workflow_id: u64,
        successor_workflow_id: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let affected = conn
            .execute(
                "UPDATE mitigation_requests SET update_workflow_id = ?3 \
                 WHERE device_key = ?1 AND workflow_id = ?2 AND update_workflow_id = 0",
                params![
                    device_key,
                    workflow_id as i64,
                    successor_workflow_id as i64
                ],
            )
            .map_err(classify)?;

        if affected == 0 {
            return Err(StoreError::PreconditionFailed {
                context: "record must exist and still be the head",
            });
        }
        Ok(())
    }

    fn set_workflow_status(
        &self,
        device_key: &str,
        workflow_id: u64,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let affected = conn
            .execute(
                "UPDATE mitigation_requests SET workflow_status = ?3 \
                 WHERE device_key = ?1 AND workflow_id = ?2",
                params![device_key, workflow_id as i64, status.as_str()],
            )
            .map_err(classify)?;

        if affected == 0 {
            return Err(StoreError::PreconditionFailed {
                context: "record must exist",
            });
        }
        Ok(())
    }

    fn get_counter(
        &self,
        device_key: &str,
        scope: &str,
    ) -> Result<Option<CounterRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let raw: Option<(String, String, i64, String)> = conn
            .query_row(
                "SELECT device_key, scope, counter, lock_status FROM workflow_counters \
                 WHERE device_key = ?1 AND scope = ?2",
                params![device_key, scope],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(classify)?;

        raw.map(|(device_key, scope, counter, lock_status)| {
            let lock_status =
                LockStatus::parse(&lock_status).map_err(|e| StoreError::CorruptRow {
                    device_key: device_key.clone(),
                    workflow_id: 0,
                    details: e.to_string(),
                })?;
            Ok(CounterRecord {
                device_key,
                scope,
                counter: counter as u64,
                lock_status,
            })
        })
        .transpose()
    }

    fn init_counter(&self, record: &CounterRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let result = conn.execute(
            "INSERT INTO workflow_counters (device_key, scope, counter, lock_status) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.device_key,
                record.scope,
                record.counter as i64,
                record.lock_status.as_str(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::PreconditionFailed {
                    context: "counter must not exist",
                })
            }
            Err(other) => Err(classify(other)),
        }
    }

    fn put_counter(
        &self,
        device_key: &str,
        scope: &str,
        new: CounterState,
        expected: CounterState,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let affected = conn
            .execute(
                "UPDATE workflow_counters SET counter = ?3, lock_status = ?4 \
                 WHERE device_key = ?1 AND scope = ?2 \
                 AND counter = ?5 AND lock_status = ?6",
                params![
                    device_key,
                    scope,
                    new.counter as i64,
                    new.lock_status.as_str(),
                    expected.counter as i64,
                    expected.lock_status.as_str(),
                ],
            )
            .map_err(classify)?;

        if affected == 0 {
            return Err(StoreError::PreconditionFailed {
                context: "counter state must match expected snapshot",
            });
        }
        Ok(())
    }
}
