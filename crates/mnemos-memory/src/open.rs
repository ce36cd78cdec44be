//! Opening store handles, with write-ahead-log quarantine.
//!
//! A corrupt `<db>-wal` file left behind by a crashed writer makes every
//! subsequent open fail. When an open fails with a corruption-class error and
//! such a file exists, it is renamed to `<db>-wal.bak_<unix-seconds>` and the
//! open is retried once.

use crate::migration;
use mnemos_types::error::{MnemosError, MnemosResult};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const MAX_OPEN_ATTEMPTS: usize = 2;

/// Open a store handle: WAL journal, busy timeout, schema migrated.
pub fn open_store(path: &Path, busy_timeout: Duration) -> MnemosResult<Connection> {
    let mut last_err = String::new();
    for attempt in 1..=MAX_OPEN_ATTEMPTS {
        match try_open(path, busy_timeout) {
            Ok(conn) => return Ok(conn),
            Err(e) if is_corruption(&e) => {
                last_err = e.to_string();
                if attempt < MAX_OPEN_ATTEMPTS && quarantine_wal(path)?.is_some() {
                    continue;
                }
                break;
            }
            Err(e) => return Err(MnemosError::Store(e.to_string())),
        }
    }
    Err(MnemosError::StoreCorruption(format!(
        "{}: {last_err}",
        path.display()
    )))
}

fn try_open(path: &Path, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    migration::run_migrations(&conn)?;
    // Force a read through the WAL so a damaged log surfaces here.
    conn.query_row("SELECT COUNT(*) FROM memory_nodes", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(conn)
}

/// Whether an open/read error indicates a damaged database or log.
pub fn is_corruption(err: &rusqlite::Error) -> bool {
    if let rusqlite::Error::SqliteFailure(e, _) = err {
        if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) {
            return true;
        }
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("malformed") || msg.contains("corrupt") || msg.contains("wal")
}

/// Path of the write-ahead log belonging to `db_path`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

/// Rename the store's WAL file out of the way, if there is one.
///
/// Returns the quarantine path when a file was moved.
pub fn quarantine_wal(db_path: &Path) -> MnemosResult<Option<PathBuf>> {
    let wal = wal_path(db_path);
    if !wal.exists() {
        return Ok(None);
    }
    let mut target = wal.clone().into_os_string();
    target.push(format!(".bak_{}", chrono::Utc::now().timestamp()));
    let target = PathBuf::from(target);
    std::fs::rename(&wal, &target)?;
    warn!(
        wal = %wal.display(),
        quarantined = %target.display(),
        "Quarantined corrupt write-ahead log"
    );

    let mut shm = db_path.as_os_str().to_owned();
    shm.push("-shm");
    let shm = PathBuf::from(shm);
    if shm.exists() {
        if let Err(e) = std::fs::remove_file(&shm) {
            warn!(path = %shm.display(), error = %e, "Failed to remove shared-memory file");
        }
    }
    info!(path = %db_path.display(), "Retrying store open without WAL");
    Ok(Some(target))
}
