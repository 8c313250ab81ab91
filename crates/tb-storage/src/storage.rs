use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use duckdb::{params, Connection, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tb_types::{
    ConfigId, Experiment, Metrics, OptimizationDirection, Status, StorageError, TbResult,
    TelemetryRecord, Trial, TrialId, TunableGroups, TunableSnapshot,
};

use crate::schema::{self, CURRENT_VERSION};

pub(crate) fn db_err(e: duckdb::Error) -> StorageError {
    StorageError::Database { message: e.to_string() }
}

fn corrupt(message: impl Into<String>) -> StorageError {
    StorageError::Corruption { message: message.into() }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("bad timestamp {raw:?}: {e}")))
}

/// JSON text for a result map. Non-finite values have no JSON form and are dropped.
fn result_json(result: &Metrics) -> Result<String, StorageError> {
    let finite: Metrics = result
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    if finite.len() != result.len() {
        warn!(dropped = result.len() - finite.len(), "Dropping non-finite result values");
    }
    serde_json::to_string(&finite).map_err(|e| corrupt(e.to_string()))
}

/// Identity and metadata of an experiment to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub id: String,
    pub description: String,
    pub optimization_target: String,
    pub optimization_direction: OptimizationDirection,
    pub root_env: String,
}

impl NewExperiment {
    pub fn new(id: impl Into<String>, optimization_target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            optimization_target: optimization_target.into(),
            optimization_direction: OptimizationDirection::Min,
            root_env: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_direction(mut self, direction: OptimizationDirection) -> Self {
        self.optimization_direction = direction;
        self
    }

    pub fn with_root_env(mut self, root_env: impl Into<String>) -> Self {
        self.root_env = root_env.into();
        self
    }
}

/// Raw trial row, converted outside the row callback so decoding
/// errors surface as [`StorageError::Corruption`].
struct TrialRow {
    exp_id: String,
    trial_id: i64,
    config_id: i64,
    runner_id: i64,
    repeat_i: i64,
    status: String,
    result_json: Option<String>,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    kv_json: String,
}

impl TrialRow {
    const SELECT: &'static str = "SELECT t.exp_id, t.trial_id, t.config_id, t.runner_id, t.repeat_i, \
         t.status, t.result_json, t.error, t.created_at, t.completed_at, c.kv_json \
         FROM trial t JOIN tunable_config c ON t.config_id = c.config_id";

    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            exp_id: row.get(0)?,
            trial_id: row.get(1)?,
            config_id: row.get(2)?,
            runner_id: row.get(3)?,
            repeat_i: row.get(4)?,
            status: row.get(5)?,
            result_json: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
            kv_json: row.get(10)?,
        })
    }

    fn into_trial(self) -> Result<Trial, StorageError> {
        let tunables: TunableSnapshot = serde_json::from_str(&self.kv_json)
            .map_err(|e| corrupt(format!("config {}: {e}", self.config_id)))?;
        let result: Metrics = match self.result_json.as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| corrupt(format!("trial {} result: {e}", self.trial_id)))?,
            None => Metrics::new(),
        };
        Ok(Trial {
            experiment_id: self.exp_id,
            trial_id: self.trial_id,
            config_id: self.config_id,
            tunables,
            runner_id: usize::try_from(self.runner_id)
                .map_err(|_| corrupt(format!("negative runner id {}", self.runner_id)))?,
            repeat_i: u32::try_from(self.repeat_i)
                .map_err(|_| corrupt(format!("bad repeat index {}", self.repeat_i)))?,
            status: Status::parse(&self.status),
            result,
            error: self.error,
            telemetry: Vec::new(),
            created_at: parse_ts(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Durable store for experiments, trials, tunable configs and telemetry.
///
/// All access goes through one connection behind a mutex; multi-statement
/// writes run in a transaction so concurrent runners never interleave.
#[derive(Debug)]
pub struct Storage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Storage {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> TbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        info!(path = %path.display(), "Opened storage");
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn in_memory() -> TbResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn, None)
    }

    /// `<data dir>/tunebench/tunebench.duckdb`, falling back to the
    /// working directory when the platform has no data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunebench")
            .join("tunebench.duckdb")
    }

    fn from_connection(mut conn: Connection, path: Option<PathBuf>) -> TbResult<Self> {
        let version = schema::migrate_to(&mut conn, CURRENT_VERSION)?;
        debug!(version, "Storage schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> TbResult<i64> {
        schema::current_version(&self.conn.lock())
    }

    /// Create the experiment, or return the stored one when the tunable
    /// schema fingerprint matches.
    pub fn create_experiment(&self, new: &NewExperiment, schema: &TunableGroups) -> TbResult<Experiment> {
        let schema_hash = schema.schema_hash();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        if let Some(existing) = Self::query_experiment(&tx, &new.id)? {
            if existing.schema_hash != schema_hash {
                return Err(StorageError::SchemaMismatch {
                    experiment_id: new.id.clone(),
                    stored: existing.schema_hash,
                    requested: schema_hash,
                }
                .into());
            }
            debug!(experiment_id = %new.id, "Experiment already exists");
            return Ok(existing);
        }

        let experiment = Experiment {
            id: new.id.clone(),
            description: new.description.clone(),
            optimization_target: new.optimization_target.clone(),
            optimization_direction: new.optimization_direction,
            root_env: new.root_env.clone(),
            schema: schema.to_json(),
            schema_hash,
            schema_version: CURRENT_VERSION,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO experiment (exp_id, description, optimization_target, optimization_direction, \
             root_env, schema_json, schema_hash, schema_version, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                experiment.id,
                experiment.description,
                experiment.optimization_target,
                experiment.optimization_direction.as_str(),
                experiment.root_env,
                experiment.schema.to_string(),
                experiment.schema_hash,
                experiment.schema_version,
                experiment.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        info!(experiment_id = %experiment.id, target = %experiment.optimization_target, "Created experiment");
        Ok(experiment)
    }

    pub fn load_experiment(&self, experiment_id: &str) -> TbResult<Experiment> {
        let conn = self.conn.lock();
        Self::query_experiment(&conn, experiment_id)?.ok_or_else(|| {
            StorageError::ExperimentNotFound {
                experiment_id: experiment_id.to_string(),
            }
            .into()
        })
    }

    fn query_experiment(conn: &Connection, experiment_id: &str) -> Result<Option<Experiment>, StorageError> {
        let row = conn.query_row(
            "SELECT exp_id, description, optimization_target, optimization_direction, root_env, \
             schema_json, schema_hash, schema_version, created_at FROM experiment WHERE exp_id = ?",
            params![experiment_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        );
        let (id, description, target, direction, root_env, schema_json, schema_hash, version, created_at) =
            match row {
                Ok(row) => row,
                Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(db_err(e)),
            };
        Ok(Some(Experiment {
            optimization_direction: OptimizationDirection::parse(&direction)
                .ok_or_else(|| corrupt(format!("unknown optimization direction {direction:?}")))?,
            schema: serde_json::from_str(&schema_json).map_err(|e| corrupt(e.to_string()))?,
            created_at: parse_ts(&created_at)?,
            id,
            description,
            optimization_target: target,
            root_env,
            schema_hash,
            schema_version: version,
        }))
    }

    /// Config id for `snapshot`, inserting a new row only for unseen content.
    fn upsert_config(tx: &Transaction<'_>, snapshot: &TunableSnapshot) -> Result<ConfigId, StorageError> {
        let hash = snapshot.content_hash();
        match tx.query_row(
            "SELECT config_id FROM tunable_config WHERE config_hash = ?",
            params![hash],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => return Ok(id),
            Err(duckdb::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(db_err(e)),
        }
        let config_id: i64 = tx
            .query_row("SELECT COALESCE(MAX(config_id), 0) + 1 FROM tunable_config", [], |row| row.get(0))
            .map_err(db_err)?;
        let kv_json = serde_json::to_string(snapshot).map_err(|e| corrupt(e.to_string()))?;
        tx.execute(
            "INSERT INTO tunable_config (config_id, config_hash, kv_json) VALUES (?, ?, ?)",
            params![config_id, hash, kv_json],
        )
        .map_err(db_err)?;
        debug!(config_id, "Stored new tunable config");
        Ok(config_id)
    }

    fn experiment_exists(conn: &Connection, experiment_id: &str) -> Result<(), StorageError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM experiment WHERE exp_id = ?",
                params![experiment_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if count == 0 {
            return Err(StorageError::ExperimentNotFound {
                experiment_id: experiment_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record a new PENDING trial with the next trial id.
    pub fn new_trial(
        &self,
        experiment_id: &str,
        snapshot: &TunableSnapshot,
        runner_id: usize,
        repeat_i: u32,
    ) -> TbResult<Trial> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::experiment_exists(&tx, experiment_id)?;

        let config_id = Self::upsert_config(&tx, snapshot)?;
        let trial_id: TrialId = tx
            .query_row(
                "SELECT COALESCE(MAX(trial_id), 0) + 1 FROM trial WHERE exp_id = ?",
                params![experiment_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let mut trial = Trial::new(experiment_id, trial_id, config_id, snapshot.clone(), runner_id);
        trial.repeat_i = repeat_i;
        tx.execute(
            "INSERT INTO trial (exp_id, trial_id, config_id, runner_id, repeat_i, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                experiment_id,
                trial_id,
                config_id,
                runner_id as i64,
                i64::from(repeat_i),
                trial.status.as_str(),
                trial.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        debug!(experiment_id, trial_id, config_id, runner_id, "Created trial");
        Ok(trial)
    }

    /// Reassign a not-yet-finished trial to another runner (used on resume).
    pub fn set_trial_runner(&self, experiment_id: &str, trial_id: TrialId, runner_id: usize) -> TbResult<()> {
        let conn = self.conn.lock();
        let status = Self::trial_status(&conn, experiment_id, trial_id)?;
        if status.is_completed() {
            return Err(StorageError::AlreadyFinalized {
                experiment_id: experiment_id.to_string(),
                trial_id,
                status: status.to_string(),
                requested: format!("runner {runner_id}"),
            }
            .into());
        }
        conn.execute(
            "UPDATE trial SET runner_id = ? WHERE exp_id = ? AND trial_id = ?",
            params![runner_id as i64, experiment_id, trial_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn trial_status(conn: &Connection, experiment_id: &str, trial_id: TrialId) -> Result<Status, StorageError> {
        match conn.query_row(
            "SELECT status FROM trial WHERE exp_id = ? AND trial_id = ?",
            params![experiment_id, trial_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(status) => Ok(Status::parse(&status)),
            Err(duckdb::Error::QueryReturnedNoRows) => Err(StorageError::TrialNotFound {
                experiment_id: experiment_id.to_string(),
                trial_id,
            }),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Move a trial to `status`, appending `telemetry`.
    ///
    /// A completed trial is frozen: repeating the same terminal status is a
    /// no-op (telemetry is still merged), any other status fails with
    /// [`StorageError::AlreadyFinalized`].
    pub fn update_trial_status(
        &self,
        experiment_id: &str,
        trial_id: TrialId,
        status: Status,
        result: &Metrics,
        error: Option<&str>,
        telemetry: &[TelemetryRecord],
    ) -> TbResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let current = Self::trial_status(&tx, experiment_id, trial_id)?;

        if current.is_completed() {
            if current != status {
                return Err(StorageError::AlreadyFinalized {
                    experiment_id: experiment_id.to_string(),
                    trial_id,
                    status: current.to_string(),
                    requested: status.to_string(),
                }
                .into());
            }
            debug!(experiment_id, trial_id, %status, "Trial already finalized with the same status");
        } else if status.is_completed() {
            tx.execute(
                "UPDATE trial SET status = ?, result_json = ?, error = ?, completed_at = ? \
                 WHERE exp_id = ? AND trial_id = ?",
                params![
                    status.as_str(),
                    result_json(result)?,
                    error,
                    Utc::now().to_rfc3339(),
                    experiment_id,
                    trial_id,
                ],
            )
            .map_err(db_err)?;
        } else {
            tx.execute(
                "UPDATE trial SET status = ? WHERE exp_id = ? AND trial_id = ?",
                params![status.as_str(), experiment_id, trial_id],
            )
            .map_err(db_err)?;
        }

        for record in telemetry {
            if !record.value.is_finite() {
                continue;
            }
            tx.execute(
                "INSERT OR IGNORE INTO trial_telemetry (exp_id, trial_id, ts, metric, value) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    experiment_id,
                    trial_id,
                    record.timestamp.to_rfc3339(),
                    record.metric,
                    record.value,
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        debug!(experiment_id, trial_id, %status, telemetry = telemetry.len(), "Updated trial");
        Ok(())
    }

    fn query_trials(&self, filter: &str, experiment_id: &str) -> TbResult<Vec<Trial>> {
        let rows = {
            let conn = self.conn.lock();
            let sql = format!("{} WHERE t.exp_id = ? {filter} ORDER BY t.trial_id", TrialRow::SELECT);
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params![experiment_id], TrialRow::from_row)
                .map_err(db_err)?
                .collect::<duckdb::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        };
        let mut trials = Vec::with_capacity(rows.len());
        for row in rows {
            let mut trial = row.into_trial()?;
            trial.telemetry = self.load_telemetry(experiment_id, trial.trial_id)?;
            trials.push(trial);
        }
        Ok(trials)
    }

    /// Every trial of the experiment with its telemetry, by trial id.
    pub fn load_trials(&self, experiment_id: &str) -> TbResult<Vec<Trial>> {
        self.query_trials("", experiment_id)
    }

    /// Trials an interrupted run left unfinished (PENDING, READY or RUNNING).
    pub fn pending_trials(&self, experiment_id: &str) -> TbResult<Vec<Trial>> {
        self.query_trials("AND t.status IN ('PENDING', 'READY', 'RUNNING')", experiment_id)
    }

    pub fn load_tunable_config(&self, config_id: ConfigId) -> TbResult<TunableSnapshot> {
        let conn = self.conn.lock();
        let kv_json = match conn.query_row(
            "SELECT kv_json FROM tunable_config WHERE config_id = ?",
            params![config_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(kv) => kv,
            Err(duckdb::Error::QueryReturnedNoRows) => {
                return Err(StorageError::ConfigNotFound { config_id }.into())
            }
            Err(e) => return Err(db_err(e).into()),
        };
        Ok(serde_json::from_str(&kv_json).map_err(|e| corrupt(format!("config {config_id}: {e}")))?)
    }

    /// Number of distinct tunable configs stored.
    pub fn config_count(&self) -> TbResult<i64> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT COUNT(*) FROM tunable_config", [], |row| row.get(0))
            .map_err(db_err)?)
    }

    pub fn load_telemetry(&self, experiment_id: &str, trial_id: TrialId) -> TbResult<Vec<TelemetryRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT ts, metric, value FROM trial_telemetry \
                     WHERE exp_id = ? AND trial_id = ? ORDER BY ts, metric",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![experiment_id, trial_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                })
                .map_err(db_err)?
                .collect::<duckdb::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        };
        rows.into_iter()
            .map(|(ts, metric, value)| Ok(TelemetryRecord::new(parse_ts(&ts)?, metric, value)))
            .collect()
    }
}
