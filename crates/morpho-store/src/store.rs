use std::fs;
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use uuid::Uuid;

use morpho_core::{AgentKind, AuditError, AuditRecord, AuditSink, Tick};

use crate::error::{Result, StoreError};
use crate::schema;

/// Filter for reading the audit log back. Empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub run_id: Option<Uuid>,
    pub kind: Option<String>,
    pub agent: Option<AgentKind>,
    pub from_tick: Option<Tick>,
    pub to_tick: Option<Tick>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(run) = self.run_id {
            clauses.push("run_id = ?");
            values.push(Value::Text(run.to_string()));
        }
        if let Some(kind) = &self.kind {
            clauses.push("kind = ?");
            values.push(Value::Text(kind.clone()));
        }
        if let Some(agent) = self.agent {
            clauses.push("agent = ?");
            values.push(Value::Text(agent.name().to_string()));
        }
        if let Some(from) = self.from_tick {
            clauses.push("tick >= ?");
            values.push(Value::Integer(to_sql_int(from)));
        }
        if let Some(to) = self.to_tick {
            clauses.push("tick <= ?");
            values.push(Value::Integer(to_sql_int(to)));
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, values)
    }
}

/// One control run as seen in the log.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub records: u64,
    pub first_tick: Tick,
    pub last_tick: Tick,
    pub started_at: String,
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("bad uuid {s}: {e}")))
}

/// SQLite-backed audit log. Rows are only ever inserted.
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::debug!(path = %path.display(), "audit store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).ok();
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Append ---

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO audit_log (run_id, seq, tick, timestamp, agent, kind, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id.to_string(),
                to_sql_int(record.seq),
                to_sql_int(record.tick),
                record.timestamp,
                record.agent.map(AgentKind::name),
                record.event.kind(),
                json,
            ],
        )?;
        Ok(())
    }

    // --- Read ---

    pub fn records(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let (filter, mut values) = query.where_clause();
        let mut sql = format!("SELECT record FROM audit_log{filter} ORDER BY id");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(to_sql_int(limit as u64)));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<String> = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    pub fn count(&self, query: &AuditQuery) -> Result<u64> {
        let (filter, values) = query.where_clause();
        let sql = format!("SELECT COUNT(*) FROM audit_log{filter}");
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Runs in the order they started.
    pub fn runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, COUNT(*), MIN(tick), MAX(tick), MIN(timestamp), MIN(id) AS first_id
             FROM audit_log GROUP BY run_id ORDER BY first_id",
        )?;
        let rows: Vec<(String, i64, i64, i64, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(run, records, first, last, started_at)| {
                Ok(RunSummary {
                    run_id: parse_uuid(&run)?,
                    records: records.max(0) as u64,
                    first_tick: first.max(0) as Tick,
                    last_tick: last.max(0) as Tick,
                    started_at,
                })
            })
            .collect()
    }

    pub fn latest_run(&self) -> Result<Option<Uuid>> {
        Ok(self.runs()?.last().map(|r| r.run_id))
    }
}

impl AuditSink for AuditStore {
    fn append(&mut self, record: &AuditRecord) -> std::result::Result<(), AuditError> {
        AuditStore::append(self, record).map_err(|e| {
            tracing::error!(seq = record.seq, error = %e, "audit append failed");
            AuditError::Sink(e.to_string())
        })
    }
}
