use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use sluice_core::{JobKey, RunId, RunInfo, RunMetrics, SourceRef};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: RunId,
    pub job_key: JobKey,
    pub pipeline: String,
    pub session_id: Option<String>,
    pub input: Value,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub llm_calls: u32,
    pub search_calls: u32,
    pub sources: Vec<SourceRef>,
    pub error: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

const SELECT_COLUMNS: &str = "SELECT run_id, job_key, pipeline, session_id, input, status, result,
        llm_calls, search_calls, sources, error, started_at, updated_at, finished_at
 FROM runs";

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, job_key = %run.key))]
    pub fn start(&self, run: &RunInfo) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let input = serde_json::to_string(&run.input)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, job_key, pipeline, session_id, input, status, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?6)",
                rusqlite::params![
                    run.run_id.as_str(),
                    run.key.as_str(),
                    run.pipeline,
                    run.session_id,
                    input,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_result(&self, run_id: &RunId, result: &Value) -> Result<(), StoreError> {
        let result = serde_json::to_string(result)?;
        self.update(
            run_id,
            "UPDATE runs SET result = ?1, updated_at = ?2 WHERE run_id = ?3",
            &result,
        )
    }

    pub fn set_metrics(&self, run_id: &RunId, metrics: &RunMetrics) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let sources = if metrics.sources.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&metrics.sources)?)
        };
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs SET llm_calls = ?1, search_calls = ?2, sources = ?3, updated_at = ?4
                 WHERE run_id = ?5",
                rusqlite::params![
                    metrics.llm_calls,
                    metrics.search_calls,
                    sources,
                    now,
                    run_id.as_str(),
                ],
            )?;
            require_row(changed, run_id)
        })
    }

    pub fn set_failure(&self, run_id: &RunId, message: &str) -> Result<(), StoreError> {
        self.update(
            run_id,
            "UPDATE runs SET status = 'failed', error = ?1, updated_at = ?2 WHERE run_id = ?3",
            message,
        )
    }

    /// Close the run. A run that did not fail is marked completed.
    pub fn finish(&self, run_id: &RunId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs
                 SET status = CASE status WHEN 'running' THEN 'completed' ELSE status END,
                     finished_at = ?1, updated_at = ?1
                 WHERE run_id = ?2",
                rusqlite::params![now, run_id.as_str()],
            )?;
            require_row(changed, run_id)
        })
    }

    fn update(&self, run_id: &RunId, sql: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(sql, rusqlite::params![value, now, run_id.as_str()])?;
            require_row(changed, run_id)
        })
    }

    pub fn get(&self, run_id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE run_id = ?1"))?;
            let mut rows = stmt.query([run_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {run_id}"))),
            }
        })
    }

    /// Runs recorded under a job key, newest first.
    pub fn list_for_key(&self, key: &JobKey) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE job_key = ?1 ORDER BY started_at DESC, run_id DESC"
            ))?;
            let mut rows = stmt.query([key.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_run(row)?);
            }
            Ok(out)
        })
    }

    pub fn count_by_status(&self, status: RunStatus) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE status = ?1",
                [status.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn require_row(changed: usize, run_id: &RunId) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound(format!("run {run_id}")));
    }
    Ok(())
}

fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table: "runs",
        column,
        detail: e.to_string(),
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| StoreError::CorruptRow {
            table: "runs",
            column,
            detail: format!("invalid JSON: {e}"),
        })
    })
    .transpose()
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status: String = get(row, 5, "status")?;
    Ok(RunRow {
        run_id: RunId::from_raw(get::<String>(row, 0, "run_id")?),
        job_key: JobKey::from_raw(get::<String>(row, 1, "job_key")?),
        pipeline: get(row, 2, "pipeline")?,
        session_id: get(row, 3, "session_id")?,
        input: json_column(Some(get::<String>(row, 4, "input")?), "input")?.unwrap_or(Value::Null),
        status: status.parse().map_err(|detail| StoreError::CorruptRow {
            table: "runs",
            column: "status",
            detail,
        })?,
        result: json_column(get(row, 6, "result")?, "result")?,
        llm_calls: get(row, 7, "llm_calls")?,
        search_calls: get(row, 8, "search_calls")?,
        sources: json_column(get(row, 9, "sources")?, "sources")?.unwrap_or_default(),
        error: get(row, 10, "error")?,
        started_at: get(row, 11, "started_at")?,
        updated_at: get(row, 12, "updated_at")?,
        finished_at: get(row, 13, "finished_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> RunRepo {
        RunRepo::new(Database::in_memory().unwrap())
    }

    fn info(key: &str) -> RunInfo {
        RunInfo {
            key: JobKey::from_raw(key),
            run_id: RunId::new(),
            pipeline: "matcher".into(),
            session_id: Some("s1".into()),
            input: json!({"company": "Acme"}),
        }
    }

    #[test]
    fn start_then_get() {
        let repo = setup();
        let run = info("matcher:abc");
        repo.start(&run).unwrap();

        let row = repo.get(&run.run_id).unwrap();
        assert_eq!(row.status, RunStatus::Running);
        assert_eq!(row.pipeline, "matcher");
        assert_eq!(row.session_id.as_deref(), Some("s1"));
        assert_eq!(row.input, json!({"company": "Acme"}));
        assert!(row.result.is_none());
        assert!(row.finished_at.is_none());
    }

    #[test]
    fn completed_run_keeps_result_and_metrics() {
        let repo = setup();
        let run = info("matcher:abc");
        repo.start(&run).unwrap();
        repo.set_result(&run.run_id, &json!({"match": "Acme NV"})).unwrap();
        repo.set_metrics(
            &run.run_id,
            &RunMetrics {
                llm_calls: 3,
                search_calls: 2,
                sources: vec![SourceRef::titled("Acme", "https://acme.example")],
            },
        )
        .unwrap();
        repo.finish(&run.run_id).unwrap();

        let row = repo.get(&run.run_id).unwrap();
        assert_eq!(row.status, RunStatus::Completed);
        assert_eq!(row.result, Some(json!({"match": "Acme NV"})));
        assert_eq!(row.llm_calls, 3);
        assert_eq!(row.search_calls, 2);
        assert_eq!(row.sources[0].url, "https://acme.example");
        assert!(row.finished_at.is_some());
    }

    #[test]
    fn failed_run_stays_failed_after_finish() {
        let repo = setup();
        let run = info("matcher:abc");
        repo.start(&run).unwrap();
        repo.set_failure(&run.run_id, "engine exploded").unwrap();
        repo.finish(&run.run_id).unwrap();

        let row = repo.get(&run.run_id).unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("engine exploded"));
        assert_eq!(repo.count_by_status(RunStatus::Failed).unwrap(), 1);
        assert_eq!(repo.count_by_status(RunStatus::Completed).unwrap(), 0);
    }

    #[test]
    fn updates_to_unknown_run_fail() {
        let repo = setup();
        let missing = RunId::from_raw("run_missing");
        assert!(matches!(repo.finish(&missing), Err(StoreError::NotFound(_))));
        assert!(matches!(repo.get(&missing), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_for_key_returns_every_execution() {
        let repo = setup();
        let first = info("matcher:k");
        let second = info("matcher:k");
        repo.start(&first).unwrap();
        repo.start(&second).unwrap();
        repo.start(&info("matcher:other")).unwrap();

        let rows = repo.list_for_key(&JobKey::from_raw("matcher:k")).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(s.to_string().parse::<RunStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
