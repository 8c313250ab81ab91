//! Table definitions and forward-only migrations.

use chrono::Utc;
use duckdb::{params, Connection};
use tracing::info;

use tb_types::{StorageError, TbResult};

use crate::storage::db_err;

/// Schema version written by this build.
pub const CURRENT_VERSION: i64 = 2;

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version BIGINT NOT NULL,
    applied_at VARCHAR NOT NULL
);";

/// v1: experiments, deduplicated configs and trials.
const V1: &str = "
CREATE TABLE IF NOT EXISTS experiment (
    exp_id VARCHAR PRIMARY KEY,
    description VARCHAR NOT NULL,
    optimization_target VARCHAR NOT NULL,
    optimization_direction VARCHAR NOT NULL,
    root_env VARCHAR NOT NULL,
    schema_json VARCHAR NOT NULL,
    schema_hash VARCHAR NOT NULL,
    schema_version BIGINT NOT NULL,
    created_at VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS tunable_config (
    config_id BIGINT PRIMARY KEY,
    config_hash VARCHAR NOT NULL UNIQUE,
    kv_json VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS trial (
    exp_id VARCHAR NOT NULL,
    trial_id BIGINT NOT NULL,
    config_id BIGINT NOT NULL,
    runner_id BIGINT NOT NULL,
    repeat_i BIGINT NOT NULL,
    status VARCHAR NOT NULL,
    result_json VARCHAR,
    error VARCHAR,
    created_at VARCHAR NOT NULL,
    completed_at VARCHAR,
    PRIMARY KEY (exp_id, trial_id)
);
";

/// v2: per-trial telemetry series.
const V2: &str = "
CREATE TABLE IF NOT EXISTS trial_telemetry (
    exp_id VARCHAR NOT NULL,
    trial_id BIGINT NOT NULL,
    ts VARCHAR NOT NULL,
    metric VARCHAR NOT NULL,
    value DOUBLE NOT NULL,
    PRIMARY KEY (exp_id, trial_id, ts, metric)
);
";

const MIGRATIONS: &[(i64, &str)] = &[(1, V1), (2, V2)];

/// Highest applied version, 0 for an empty database.
pub fn current_version(conn: &Connection) -> TbResult<i64> {
    conn.execute_batch(VERSION_TABLE).map_err(db_err)?;
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .map_err(db_err)?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration above the stored version, up to `target`.
pub fn migrate_to(conn: &mut Connection, target: i64) -> TbResult<i64> {
    let from = current_version(conn)?;
    if from > CURRENT_VERSION {
        return Err(StorageError::Migration {
            from,
            message: format!("database is newer than this build (max version {CURRENT_VERSION})"),
        }
        .into());
    }
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > from && *v <= target) {
        let migration_err = |e: duckdb::Error| StorageError::Migration {
            from,
            message: format!("step to v{version}: {e}"),
        };
        let tx = conn.transaction().map_err(migration_err)?;
        tx.execute_batch(sql).map_err(migration_err)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![version, Utc::now().to_rfc3339()],
        )
        .map_err(migration_err)?;
        tx.commit().map_err(migration_err)?;
        info!(version, "Applied storage migration");
    }
    current_version(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_migrates_to_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert_eq!(migrate_to(&mut conn, CURRENT_VERSION).unwrap(), CURRENT_VERSION);
        // Idempotent.
        assert_eq!(migrate_to(&mut conn, CURRENT_VERSION).unwrap(), CURRENT_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn refuses_newer_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        current_version(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![CURRENT_VERSION + 1, "2030-01-01T00:00:00Z"],
        )
        .unwrap();
        assert!(migrate_to(&mut conn, CURRENT_VERSION).is_err());
    }
}
