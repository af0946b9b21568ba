//! Device record store
//!
//! Persisted registry of datakit agents keyed by `conn_id`, with a
//! constrained status state machine and heartbeat-based liveness. The store
//! enforces the transition invariant centrally in [`DatakitRepo::update_status`];
//! callers never write a status directly. Serialization of concurrent writers
//! for the same `conn_id` is provided by row-level transactions; the registry
//! additionally orders register/unregister events per agent.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;
use serde::Serialize;

use super::DbPool;
use crate::message::DatakitDescriptor;
use crate::{Error, Result};

/// Status of a datakit agent
///
/// Transitions are constrained: an agent may always stay where it is, leave
/// `Running` for anything, or arrive at `Running` or `Offline` from anywhere.
/// Direct moves between two busy states (e.g. `Upgrading` -> `Restarting`)
/// are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatakitStatus {
    Running,
    Offline,
    Stopped,
    Upgrading,
    Restarting,
}

impl DatakitStatus {
    /// Stable lowercase form stored in the database and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Offline => "offline",
            Self::Stopped => "stopped",
            Self::Upgrading => "upgrading",
            Self::Restarting => "restarting",
        }
    }

    /// Parse the stored form back into a status
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "offline" => Some(Self::Offline),
            "stopped" => Some(Self::Stopped),
            "upgrading" => Some(Self::Upgrading),
            "restarting" => Some(Self::Restarting),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `to` is permitted
    #[must_use]
    pub fn allowed(self, to: Self) -> bool {
        self == to || self == Self::Running || to == Self::Running || to == Self::Offline
    }

    /// Whether the agent can accept an upgrade or restart request right now
    #[must_use]
    pub fn accepts_disruptive_ops(self) -> bool {
        !matches!(self, Self::Offline | Self::Upgrading | Self::Restarting)
    }
}

/// A persisted device record
#[derive(Debug, Clone, Serialize)]
pub struct DatakitRecord {
    pub conn_id: String,
    pub runtime_id: String,
    pub workspace_uuid: String,
    pub host_name: String,
    pub ip: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub run_mode: String,
    pub usage_cores: i64,
    pub start_time: i64,
    pub run_in_container: bool,
    pub url: String,
    pub status: DatakitStatus,
    pub global_host_tags: HashMap<String, String>,
    /// Heartbeat lease timestamp
    pub updated_at: DateTime<Utc>,
}

impl DatakitRecord {
    /// Build a record from a handshake descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: &DatakitDescriptor, status: DatakitStatus) -> Self {
        Self {
            conn_id: descriptor.conn_id.clone(),
            runtime_id: descriptor.runtime_id.clone(),
            workspace_uuid: descriptor.workspace_uuid.clone(),
            host_name: descriptor.host_name.clone(),
            ip: descriptor.ip.clone(),
            os: descriptor.os.clone(),
            arch: descriptor.arch.clone(),
            version: descriptor.version.clone(),
            run_mode: descriptor.run_mode.clone(),
            usage_cores: descriptor.usage_cores,
            start_time: descriptor.start_time,
            run_in_container: descriptor.run_in_container,
            url: descriptor.url.clone(),
            status,
            global_host_tags: descriptor.global_host_tags.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Device record repository
#[derive(Clone)]
pub struct DatakitRepo {
    pool: DbPool,
}

const RECORD_COLUMNS: &str = "conn_id, runtime_id, workspace_uuid, host_name, ip, os, arch, \
     version, run_mode, usage_cores, start_time, run_in_container, url, status, \
     global_host_tags, updated_at";

impl DatakitRepo {
    /// Create a new repository over the shared pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Find a record by its `conn_id`
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn find(&self, conn_id: &str) -> Result<Option<DatakitRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM datakit WHERE conn_id = ?1"),
                [conn_id],
                row_to_record,
            )
            .ok();
        Ok(record)
    }

    /// List all records, most recently active first
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn list(&self) -> Result<Vec<DatakitRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM datakit ORDER BY updated_at DESC"
        ))?;
        let records = stmt
            .query_map([], row_to_record)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(records)
    }

    /// Insert a new record along with its host tag row
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn insert(&self, record: &DatakitRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_in_tx(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Full field replace keyed by `conn_id`, bumping the lease
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn update(&self, record: &DatakitRecord) -> Result<()> {
        let tags = serde_json::to_string(&record.global_host_tags)?;
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE datakit SET runtime_id = ?2, workspace_uuid = ?3, host_name = ?4,
                 ip = ?5, os = ?6, arch = ?7, version = ?8, run_mode = ?9,
                 usage_cores = ?10, start_time = ?11, run_in_container = ?12, url = ?13,
                 status = ?14, global_host_tags = ?15, updated_at = ?16
             WHERE conn_id = ?1",
            rusqlite::params![
                record.conn_id,
                record.runtime_id,
                record.workspace_uuid,
                record.host_name,
                record.ip,
                record.os,
                record.arch,
                record.version,
                record.run_mode,
                record.usage_cores,
                record.start_time,
                record.run_in_container,
                record.url,
                record.status.as_str(),
                tags,
                now,
            ],
        )?;
        tx.execute(
            "DELETE FROM global_host_tags WHERE conn_id = ?1",
            [&record.conn_id],
        )?;
        tx.execute(
            "INSERT INTO global_host_tags (conn_id, workspace_uuid, tags) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                record.conn_id,
                record.workspace_uuid,
                serde_json::to_string(&record.global_host_tags)?
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Force-replace the record for a registering agent
    ///
    /// Deletes any previous row for the `conn_id` and inserts a fresh one
    /// with status `Running`. Used by the registry once the duplicate check
    /// has passed.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn replace(&self, record: &DatakitRecord) -> Result<DatakitRecord> {
        let mut fresh = record.clone();
        fresh.status = DatakitStatus::Running;
        fresh.updated_at = Utc::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM datakit WHERE conn_id = ?1", [&fresh.conn_id])?;
        tx.execute(
            "DELETE FROM global_host_tags WHERE conn_id = ?1",
            [&fresh.conn_id],
        )?;
        insert_in_tx(&tx, &fresh)?;
        tx.commit()?;
        Ok(fresh)
    }

    /// Transition a record's status, enforcing the state machine
    ///
    /// Reads the current status and writes the new one only when
    /// [`DatakitStatus::allowed`] holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] on a disallowed pair,
    /// [`Error::NotFound`] if there is no row for the `conn_id`.
    pub fn update_status(&self, conn_id: &str, to: DatakitStatus) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: String = tx
            .query_row(
                "SELECT status FROM datakit WHERE conn_id = ?1",
                [conn_id],
                |row| row.get(0),
            )
            .map_err(|_| Error::NotFound(conn_id.to_string()))?;
        let from = DatakitStatus::parse(&current)
            .ok_or_else(|| Error::Database(format!("corrupt status {current}")))?;

        if !from.allowed(to) {
            return Err(Error::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        tx.execute(
            "UPDATE datakit SET status = ?2, updated_at = ?3 WHERE conn_id = ?1",
            rusqlite::params![conn_id, to.as_str(), Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Soft delete: flip the record to `Offline`, keeping the row
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn deregister(&self, conn_id: &str) -> Result<()> {
        self.update_status(conn_id, DatakitStatus::Offline)
    }

    /// Hard delete: remove the row and its tag rows
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn purge(&self, conn_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM datakit WHERE conn_id = ?1", [conn_id])?;
        tx.execute("DELETE FROM global_host_tags WHERE conn_id = ?1", [conn_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Bump the heartbeat lease for a live agent
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn heartbeat(&self, conn_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE datakit SET updated_at = ?2 WHERE conn_id = ?1",
            rusqlite::params![conn_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Whether a non-Offline row already exists for this `conn_id`
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn is_duplicate_connection(&self, conn_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM datakit WHERE conn_id = ?1 AND status != 'offline')",
            [conn_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Startup cleanup: no agent can be live before the server accepts
    /// connections, so every row is forced to `Offline`; rows past the
    /// staleness window or belonging to ephemeral containerized agents are
    /// purged, along with orphaned tag rows.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn startup_cleanup(&self, stale_after: Duration) -> Result<()> {
        let cutoff = (Utc::now() - stale_after).to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE datakit SET status = 'offline' WHERE status != 'offline'",
            [],
        )?;
        let purged = tx.execute(
            "DELETE FROM datakit WHERE updated_at < ?1 OR run_in_container = 1",
            [&cutoff],
        )?;
        let orphaned = tx.execute(
            "DELETE FROM global_host_tags
             WHERE conn_id NOT IN (SELECT conn_id FROM datakit)",
            [],
        )?;
        tx.commit()?;

        tracing::info!(purged, orphaned, "startup cleanup complete");
        Ok(())
    }
}

fn insert_in_tx(tx: &rusqlite::Transaction<'_>, record: &DatakitRecord) -> Result<()> {
    let tags = serde_json::to_string(&record.global_host_tags)?;
    tx.execute(
        &format!(
            "INSERT INTO datakit ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        rusqlite::params![
            record.conn_id,
            record.runtime_id,
            record.workspace_uuid,
            record.host_name,
            record.ip,
            record.os,
            record.arch,
            record.version,
            record.run_mode,
            record.usage_cores,
            record.start_time,
            record.run_in_container,
            record.url,
            record.status.as_str(),
            tags,
            record.updated_at.to_rfc3339(),
        ],
    )?;
    tx.execute(
        "INSERT INTO global_host_tags (conn_id, workspace_uuid, tags) VALUES (?1, ?2, ?3)",
        rusqlite::params![record.conn_id, record.workspace_uuid, tags],
    )?;
    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DatakitRecord> {
    let status_raw: String = row.get(13)?;
    let tags_raw: String = row.get(14)?;
    Ok(DatakitRecord {
        conn_id: row.get(0)?,
        runtime_id: row.get(1)?,
        workspace_uuid: row.get(2)?,
        host_name: row.get(3)?,
        ip: row.get(4)?,
        os: row.get(5)?,
        arch: row.get(6)?,
        version: row.get(7)?,
        run_mode: row.get(8)?,
        usage_cores: row.get(9)?,
        start_time: row.get(10)?,
        run_in_container: row.get(11)?,
        url: row.get(12)?,
        status: DatakitStatus::parse(&status_raw).unwrap_or(DatakitStatus::Offline),
        global_host_tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        updated_at: parse_datetime(&row.get::<_, String>(15)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
