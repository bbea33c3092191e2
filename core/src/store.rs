use crate::model::{Host, Port, ScanResult, ScanStatus, ScanTarget};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: Uuid,
    #[serde(default)]
    pub target_id: Option<Uuid>,
    pub target: String,
    pub scanner: String,
    pub status: ScanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn from_result(target_id: Option<Uuid>, result: &ScanResult) -> Self {
        Self {
            id: result.id,
            target_id,
            target: result.target.clone(),
            scanner: result.scanner.clone(),
            status: result.status,
            start_time: result.start_time,
            end_time: result.end_time,
            duration: result.duration.clone(),
            raw_output: result.raw_output.clone(),
            error: result.error.clone(),
        }
    }

    pub fn into_result(self, hosts: Vec<Host>) -> ScanResult {
        ScanResult {
            id: self.id,
            target: self.target,
            scanner: self.scanner,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration: self.duration,
            hosts,
            raw_output: self.raw_output,
            error: self.error,
        }
    }
}

impl From<&ScanResult> for ScanRecord {
    fn from(result: &ScanResult) -> Self {
        Self::from_result(None, result)
    }
}

pub trait Repository {
    fn create_target(&self, target: &ScanTarget) -> Result<(), StoreError>;
    fn get_target(&self, id: Uuid) -> Result<ScanTarget, StoreError>;
    fn list_targets(&self) -> Result<Vec<ScanTarget>, StoreError>;

    fn create_scan(&self, scan: &ScanRecord) -> Result<(), StoreError>;
    fn update_scan(&self, scan: &ScanRecord) -> Result<(), StoreError>;
    fn get_scan(&self, id: Uuid) -> Result<ScanRecord, StoreError>;
    /// Newest first; all scans when `target_id` is `None`.
    fn list_scans(&self, target_id: Option<Uuid>) -> Result<Vec<ScanRecord>, StoreError>;

    fn create_host(&self, host: &Host) -> Result<(), StoreError>;
    fn hosts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Host>, StoreError>;

    fn create_port(&self, port: &Port) -> Result<(), StoreError>;
    fn ports_for_host(&self, host_id: Uuid) -> Result<Vec<Port>, StoreError>;

    fn find_target(&self, target: &str) -> Result<Option<ScanTarget>, StoreError> {
        Ok(self
            .list_targets()?
            .into_iter()
            .find(|existing| existing.target == target))
    }
}

/// Persists a whole result: the scan record, then each host, then its ports.
/// Stops at the first failure.
pub fn save_scan_result<R>(
    repo: &R,
    target_id: Option<Uuid>,
    result: &ScanResult,
) -> Result<(), StoreError>
where
    R: Repository + ?Sized,
{
    repo.create_scan(&ScanRecord::from_result(target_id, result))?;
    for host in &result.hosts {
        repo.create_host(host)?;
        for port in &host.ports {
            repo.create_port(port)?;
        }
    }
    debug!(scan_id = %result.id, hosts = result.hosts.len(), "saved scan result");
    Ok(())
}

pub fn load_scan_result<R>(repo: &R, id: Uuid) -> Result<ScanResult, StoreError>
where
    R: Repository + ?Sized,
{
    let record = repo.get_scan(id)?;
    let mut hosts = repo.hosts_for_scan(id)?;
    hosts.sort_by_key(|host| host.ip_address);
    for host in &mut hosts {
        let mut ports = repo.ports_for_host(host.id)?;
        ports.sort_by_key(|port| (port.number, port.protocol));
        host.ports = ports;
    }
    Ok(record.into_result(hosts))
}

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS targets (
    id TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    kind TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_targets_target ON targets(target);

CREATE TABLE IF NOT EXISTS scans (
    id TEXT PRIMARY KEY,
    target_id TEXT REFERENCES targets(id) ON DELETE SET NULL,
    target TEXT NOT NULL,
    scanner TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration TEXT NOT NULL DEFAULT '',
    raw_output TEXT NOT NULL DEFAULT '',
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_scans_target_id ON scans(target_id);

CREATE TABLE IF NOT EXISTS hosts (
    id TEXT PRIMARY KEY,
    scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
    ip_address TEXT NOT NULL,
    hostname TEXT,
    status TEXT NOT NULL,
    os TEXT,
    os_confidence INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hosts_scan_id ON hosts(scan_id);

CREATE TABLE IF NOT EXISTS ports (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    state TEXT NOT NULL,
    service TEXT,
    version TEXT,
    product TEXT,
    extra_info TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ports_host_id ON ports(host_id);
";

const SCAN_COLUMNS: &str =
    "id, target_id, target, scanner, status, start_time, end_time, duration, raw_output, error";
const TARGET_COLUMNS: &str = "id, target, kind, description, created_at, updated_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "scan database opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

fn timestamp(value: OffsetDateTime) -> rusqlite::Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => text.parse().map(Some).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        }),
        None => Ok(None),
    }
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let text: String = row.get(idx)?;
    OffsetDateTime::parse(&text, &Rfc3339)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn time_at_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => OffsetDateTime::parse(&text, &Rfc3339).map(Some).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        }),
        None => Ok(None),
    }
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<ScanTarget> {
    Ok(ScanTarget {
        id: parsed(row, 0)?,
        target: row.get(1)?,
        kind: parsed(row, 2)?,
        description: row.get(3)?,
        created_at: time_at(row, 4)?,
        updated_at: time_at(row, 5)?,
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
    Ok(ScanRecord {
        id: parsed(row, 0)?,
        target_id: parsed_opt(row, 1)?,
        target: row.get(2)?,
        scanner: row.get(3)?,
        status: parsed(row, 4)?,
        start_time: time_at(row, 5)?,
        end_time: time_at_opt(row, 6)?,
        duration: row.get(7)?,
        raw_output: row.get(8)?,
        error: row.get(9)?,
    })
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: parsed(row, 0)?,
        scan_id: parsed(row, 1)?,
        ip_address: parsed(row, 2)?,
        hostname: row.get(3)?,
        status: parsed(row, 4)?,
        os: row.get(5)?,
        os_confidence: row.get(6)?,
        ports: Vec::new(),
        created_at: time_at(row, 7)?,
    })
}

fn port_from_row(row: &Row<'_>) -> rusqlite::Result<Port> {
    Ok(Port {
        id: parsed(row, 0)?,
        host_id: parsed(row, 1)?,
        number: row.get(2)?,
        protocol: parsed(row, 3)?,
        state: parsed(row, 4)?,
        service: row.get(5)?,
        version: row.get(6)?,
        product: row.get(7)?,
        extra_info: row.get(8)?,
        created_at: time_at(row, 9)?,
    })
}

fn inserted(result: rusqlite::Result<usize>, kind: &'static str, id: Uuid) -> Result<(), StoreError> {
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Err(StoreError::Duplicate { kind, id })
        }
        Err(err) => Err(err.into()),
    }
}

fn found<T>(result: rusqlite::Result<T>, kind: &'static str, id: Uuid) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound { kind, id }),
        Err(err) => Err(err.into()),
    }
}

impl Repository for SqliteStore {
    fn create_target(&self, target: &ScanTarget) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO targets (id, target, kind, description, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.id.to_string(),
                target.target,
                target.kind.as_str(),
                target.description,
                timestamp(target.created_at)?,
                timestamp(target.updated_at)?,
            ],
        );
        inserted(result, "target", target.id)
    }

    fn get_target(&self, id: Uuid) -> Result<ScanTarget, StoreError> {
        let result = self.conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
            params![id.to_string()],
            target_from_row,
        );
        found(result, "target", id)
    }

    fn list_targets(&self) -> Result<Vec<ScanTarget>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TARGET_COLUMNS} FROM targets"))?;
        let mut targets = stmt
            .query_map([], target_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        targets.sort_by_key(|target| target.created_at);
        Ok(targets)
    }

    fn find_target(&self, target: &str) -> Result<Option<ScanTarget>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE target = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![target], target_from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn create_scan(&self, scan: &ScanRecord) -> Result<(), StoreError> {
        let result = self.conn.execute(
            &format!(
                "INSERT INTO scans ({SCAN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                scan.id.to_string(),
                scan.target_id.map(|id| id.to_string()),
                scan.target,
                scan.scanner,
                scan.status.as_str(),
                timestamp(scan.start_time)?,
                scan.end_time.map(timestamp).transpose()?,
                scan.duration,
                scan.raw_output,
                scan.error,
            ],
        );
        inserted(result, "scan", scan.id)
    }

    fn update_scan(&self, scan: &ScanRecord) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE scans SET target_id = ?2, target = ?3, scanner = ?4, status = ?5, \
             start_time = ?6, end_time = ?7, duration = ?8, raw_output = ?9, error = ?10 \
             WHERE id = ?1",
            params![
                scan.id.to_string(),
                scan.target_id.map(|id| id.to_string()),
                scan.target,
                scan.scanner,
                scan.status.as_str(),
                timestamp(scan.start_time)?,
                scan.end_time.map(timestamp).transpose()?,
                scan.duration,
                scan.raw_output,
                scan.error,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "scan",
                id: scan.id,
            });
        }
        Ok(())
    }

    fn get_scan(&self, id: Uuid) -> Result<ScanRecord, StoreError> {
        let result = self.conn.query_row(
            &format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = ?1"),
            params![id.to_string()],
            scan_from_row,
        );
        found(result, "scan", id)
    }

    fn list_scans(&self, target_id: Option<Uuid>) -> Result<Vec<ScanRecord>, StoreError> {
        let mut scans = match target_id {
            Some(target_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {SCAN_COLUMNS} FROM scans WHERE target_id = ?1"
                ))?;
                let rows = stmt.query_map(params![target_id.to_string()], scan_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT {SCAN_COLUMNS} FROM scans"))?;
                let rows = stmt.query_map([], scan_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        scans.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(scans)
    }

    fn create_host(&self, host: &Host) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO hosts (id, scan_id, ip_address, hostname, status, os, os_confidence, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                host.id.to_string(),
                host.scan_id.to_string(),
                host.ip_address.to_string(),
                host.hostname,
                host.status.as_str(),
                host.os,
                host.os_confidence,
                timestamp(host.created_at)?,
            ],
        );
        inserted(result, "host", host.id)
    }

    fn hosts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Host>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scan_id, ip_address, hostname, status, os, os_confidence, created_at \
             FROM hosts WHERE scan_id = ?1",
        )?;
        let rows = stmt.query_map(params![scan_id.to_string()], host_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_port(&self, port: &Port) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO ports (id, host_id, number, protocol, state, service, version, product, \
             extra_info, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                port.id.to_string(),
                port.host_id.to_string(),
                port.number,
                port.protocol.as_str(),
                port.state.as_str(),
                port.service,
                port.version,
                port.product,
                port.extra_info,
                timestamp(port.created_at)?,
            ],
        );
        inserted(result, "port", port.id)
    }

    fn ports_for_host(&self, host_id: Uuid) -> Result<Vec<Port>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, host_id, number, protocol, state, service, version, product, extra_info, \
             created_at FROM ports WHERE host_id = ?1",
        )?;
        let rows = stmt.query_map(params![host_id.to_string()], port_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
