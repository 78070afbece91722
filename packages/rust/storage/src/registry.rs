//! libSQL run registry: which runs happened, their stage counts, and where
//! their manifests live.
//!
//! The pipeline opens it read-write via [`RunRegistry::open`]; `report`
//! only reads and uses [`RunRegistry::open_readonly`].

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};

use loreforge_shared::{LoreforgeError, Result};

use crate::migrations;

/// Lifecycle state of a registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(LoreforgeError::Storage(format!("unknown run status '{other}'"))),
        }
    }
}

/// One row of the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub manifest_path: Option<String>,
}

/// Counts recorded for one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: String,
    pub recorded_at: DateTime<Utc>,
    pub records_in: u64,
    pub records_out: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

/// Handle to the run registry database.
pub struct RunRegistry {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl RunRegistry {
    /// Open or create the registry at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LoreforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let registry = Self {
            db,
            conn,
            readonly: false,
        };
        registry.run_migrations().await?;
        Ok(registry)
    }

    /// Open an existing registry for reading only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoreforgeError::Storage(format!(
                "run registry not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LoreforgeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LoreforgeError::Storage(
                "run registry is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Register a run as `running`.
    pub async fn start_run(&self, run_id: &str, command: &str, config_json: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (run_id, command, started_at, status, config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, command, now.as_str(), RunStatus::Running.as_str(), config_json],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Mark a run finished and remember its manifest location.
    pub async fn finish_run(&self, run_id: &str, status: RunStatus, manifest_path: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, manifest_path = ?3 WHERE run_id = ?4",
                params![now.as_str(), status.as_str(), manifest_path, run_id],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LoreforgeError::Storage(format!("run {run_id} is not registered")));
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, command, started_at, finished_at, status, manifest_path
                 FROM runs WHERE run_id = ?1",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, command, started_at, finished_at, status, manifest_path
                 FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Record (or re-record) the counts of one stage.
    pub async fn record_stage(&self, run_id: &str, stage: &StageEntry) -> Result<()> {
        self.check_writable()?;
        let stats_json = stage
            .stats
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LoreforgeError::Storage(format!("serialize stage stats: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO run_stages (run_id, stage, recorded_at, records_in, records_out, skipped, stats_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, stage) DO UPDATE SET
                   recorded_at = excluded.recorded_at,
                   records_in = excluded.records_in,
                   records_out = excluded.records_out,
                   skipped = excluded.skipped,
                   stats_json = excluded.stats_json",
                params![
                    run_id,
                    stage.stage.as_str(),
                    stage.recorded_at.to_rfc3339(),
                    stage.records_in as i64,
                    stage.records_out as i64,
                    stage.skipped as i64,
                    stats_json
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Stages of a run in the order they were recorded.
    pub async fn stages(&self, run_id: &str) -> Result<Vec<StageEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, recorded_at, records_in, records_out, skipped, stats_json
                 FROM run_stages WHERE run_id = ?1 ORDER BY recorded_at, rowid",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut stages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let stats = match row.get::<String>(5).ok() {
                Some(raw) => Some(
                    serde_json::from_str(&raw)
                        .map_err(|e| LoreforgeError::Storage(format!("invalid stage stats: {e}")))?,
                ),
                None => None,
            };
            stages.push(StageEntry {
                stage: row.get::<String>(0).map_err(db_err)?,
                recorded_at: parse_time(&row.get::<String>(1).map_err(db_err)?)?,
                records_in: row.get::<i64>(2).map_err(db_err)? as u64,
                records_out: row.get::<i64>(3).map_err(db_err)? as u64,
                skipped: row.get::<i64>(4).map_err(db_err)? as u64,
                stats,
            });
        }
        Ok(stages)
    }
}

fn row_to_run(row: &libsql::Row) -> Result<RunEntry> {
    let finished_at = match row.get::<String>(3).ok() {
        Some(s) => Some(parse_time(&s)?),
        None => None,
    };
    Ok(RunEntry {
        run_id: row.get::<String>(0).map_err(db_err)?,
        command: row.get::<String>(1).map_err(db_err)?,
        started_at: parse_time(&row.get::<String>(2).map_err(db_err)?)?,
        finished_at,
        status: RunStatus::parse(&row.get::<String>(4).map_err(db_err)?)?,
        manifest_path: row.get::<String>(5).ok(),
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoreforgeError::Storage(format!("invalid date: {e}")))
}

fn db_err(e: libsql::Error) -> LoreforgeError {
    LoreforgeError::Storage(e.to_string())
}
