//! In-memory session pool for tests.
//!
//! Records every statement together with the session that ran it and the
//! partition that session was scoped to. It understands just enough SQL to
//! stand in for PostgreSQL under the session manager, the migration runner
//! and the provisioning service:
//!
//! - the isolation directive (tracks the session's scope)
//! - `BEGIN` / `COMMIT` / `ROLLBACK` around migration records
//! - `CREATE SCHEMA` / `DROP SCHEMA` and the `information_schema.schemata` lookup
//! - the `migrations` bookkeeping statements
//!
//! Anything else returns seeded rows (or nothing). Failures can be injected
//! for acquisition and for any statement containing a pattern.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{TenancyError, TenancyResult};
use crate::migrate::{CURRENT_SEQUENCE_SQL, RECORD_MIGRATION_SQL};
use crate::session::{PooledSession, Row, SessionPool, SqlValue};

const DIRECTIVE_PREFIX: &str = "SET search_path TO ";

/// A statement as the pool saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRecord {
    pub session: usize,
    /// Partition the session was scoped to when the statement ran.
    pub scope: Option<String>,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

type Responder = Arc<dyn Fn(&str, &str, &[SqlValue]) -> Option<Vec<Row>> + Send + Sync>;

type ErrorFactory = Arc<dyn Fn() -> TenancyError + Send + Sync>;

struct Failure {
    pattern: String,
    error: Option<ErrorFactory>,
}

struct Seed {
    scope: String,
    fragment: String,
    rows: Vec<Row>,
}

struct State {
    next_session: usize,
    acquired: usize,
    released: usize,
    discarded: usize,
    fail_acquire: bool,
    failures: Vec<Failure>,
    statements: Vec<StatementRecord>,
    seeds: Vec<Seed>,
    responder: Option<Responder>,
    schemas: BTreeSet<String>,
    migrations: HashMap<String, BTreeMap<i64, String>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_session: 0,
            acquired: 0,
            released: 0,
            discarded: 0,
            fail_acquire: false,
            failures: Vec::new(),
            statements: Vec::new(),
            seeds: Vec::new(),
            responder: None,
            schemas: BTreeSet::from(["public".to_string()]),
            migrations: HashMap::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryPool {
    state: Arc<Mutex<State>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `acquire` fail (or succeed again).
    pub fn fail_acquire(&self, fail: bool) {
        self.state.lock().fail_acquire = fail;
    }

    /// Fail every statement containing `pattern` until cleared.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().failures.push(Failure {
            pattern: pattern.into(),
            error: None,
        });
    }

    /// Like [`fail_on`](Self::fail_on), failing with the error `make` builds.
    pub fn fail_on_with<F>(&self, pattern: impl Into<String>, make: F)
    where
        F: Fn() -> TenancyError + Send + Sync + 'static,
    {
        self.state.lock().failures.push(Failure {
            pattern: pattern.into(),
            error: Some(Arc::new(make)),
        });
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.fail_acquire = false;
    }

    /// Rows returned to sessions scoped to `scope` for statements containing `fragment`.
    pub fn seed_rows(&self, scope: &str, fragment: &str, rows: Vec<Row>) {
        self.state.lock().seeds.push(Seed {
            scope: scope.to_string(),
            fragment: fragment.to_string(),
            rows,
        });
    }

    /// Consulted before seeded rows with `(scope, sql, params)`.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &str, &[SqlValue]) -> Option<Vec<Row>> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    pub fn discarded(&self) -> usize {
        self.state.lock().discarded
    }

    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.acquired - state.released - state.discarded
    }

    pub fn statements(&self) -> Vec<StatementRecord> {
        self.state.lock().statements.clone()
    }

    pub fn statements_for(&self, session: usize) -> Vec<StatementRecord> {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.session == session)
            .cloned()
            .collect()
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.state.lock().schemas.contains(name)
    }

    /// Sequence numbers recorded in the partition's `migrations` table.
    pub fn applied_migrations(&self, scope: &str) -> Vec<i64> {
        self.state
            .lock()
            .migrations
            .get(scope)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionPool for MemoryPool {
    async fn acquire(&self) -> TenancyResult<Box<dyn PooledSession>> {
        let mut state = self.state.lock();
        if state.fail_acquire {
            return Err(TenancyError::Acquisition("pool timed out".to_string()));
        }

        let id = state.next_session;
        state.next_session += 1;
        state.acquired += 1;

        Ok(Box::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
            scope: None,
            pending: None,
            finished: false,
        }))
    }
}

struct MemorySession {
    id: usize,
    state: Arc<Mutex<State>>,
    scope: Option<String>,
    /// Migration records written inside an open transaction.
    pending: Option<Vec<(i64, String)>>,
    finished: bool,
}

struct Outcome {
    rows: Vec<Row>,
    affected: u64,
}

impl Outcome {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            affected: 0,
        }
    }

    fn rows(rows: Vec<Row>) -> Self {
        let affected = rows.len() as u64;
        Self { rows, affected }
    }
}

fn single(column: &str, value: Value) -> Vec<Row> {
    let mut row = Row::new();
    row.insert(column.to_string(), value);
    vec![row]
}

fn identifier(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(';')
        .trim_matches('"')
        .to_string()
}

impl MemorySession {
    fn scope_key(&self) -> String {
        self.scope.clone().unwrap_or_else(|| "public".to_string())
    }

    fn run(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<Outcome> {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock();

        state.statements.push(StatementRecord {
            session: self.id,
            scope: self.scope.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        if let Some(failure) = state.failures.iter().find(|f| sql.contains(f.pattern.as_str())) {
            return Err(match &failure.error {
                Some(make) => make(),
                None => TenancyError::Query(format!("injected failure on {:?}", failure.pattern)),
            });
        }

        let trimmed = sql.trim();

        if let Some(rest) = trimmed.strip_prefix(DIRECTIVE_PREFIX) {
            let first = rest.split(',').next().unwrap_or_default();
            self.scope = Some(identifier(first));
            return Ok(Outcome::empty());
        }

        if trimmed.eq_ignore_ascii_case("BEGIN") {
            self.pending = Some(Vec::new());
            return Ok(Outcome::empty());
        }

        if trimmed.eq_ignore_ascii_case("COMMIT") {
            let scope = self.scope_key();
            for (sequence, name) in self.pending.take().unwrap_or_default() {
                state.migrations.entry(scope.clone()).or_default().insert(sequence, name);
            }
            return Ok(Outcome::empty());
        }

        if trimmed.eq_ignore_ascii_case("ROLLBACK") {
            self.pending = None;
            return Ok(Outcome::empty());
        }

        if let Some(rest) = trimmed.strip_prefix("CREATE SCHEMA IF NOT EXISTS ") {
            state.schemas.insert(identifier(rest));
            return Ok(Outcome::empty());
        }

        if let Some(rest) = trimmed.strip_prefix("DROP SCHEMA IF EXISTS ") {
            let name = identifier(rest);
            state.schemas.remove(&name);
            state.migrations.remove(&name);
            return Ok(Outcome::empty());
        }

        if trimmed.contains("information_schema.schemata") {
            let exists = match params.first() {
                Some(SqlValue::Text(name)) => state.schemas.contains(name),
                _ => false,
            };
            return Ok(Outcome::rows(single("exists", json!(exists))));
        }

        if trimmed == CURRENT_SEQUENCE_SQL {
            let current = state
                .migrations
                .get(&self.scope_key())
                .and_then(|m| m.keys().next_back().copied())
                .unwrap_or(0);
            return Ok(Outcome::rows(single("current", json!(current))));
        }

        if trimmed == RECORD_MIGRATION_SQL {
            let record = match params {
                [SqlValue::Int(sequence), SqlValue::Text(name)] => (*sequence, name.clone()),
                _ => {
                    return Err(TenancyError::Query(
                        "migration record needs (sequence, name)".to_string(),
                    ))
                }
            };
            match self.pending.as_mut() {
                Some(pending) => pending.push(record),
                None => {
                    state
                        .migrations
                        .entry(self.scope_key())
                        .or_default()
                        .insert(record.0, record.1);
                }
            }
            return Ok(Outcome { rows: Vec::new(), affected: 1 });
        }

        let scope = self.scope_key();
        if let Some(responder) = state.responder.clone() {
            if let Some(rows) = responder(&scope, trimmed, params) {
                return Ok(Outcome::rows(rows));
            }
        }

        let rows: Vec<Row> = state
            .seeds
            .iter()
            .filter(|seed| seed.scope == scope && trimmed.contains(&seed.fragment))
            .flat_map(|seed| seed.rows.iter().cloned())
            .collect();
        Ok(Outcome::rows(rows))
    }

    fn finish(&mut self, discarded: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut state = self.state.lock();
        if discarded {
            state.discarded += 1;
        } else {
            state.released += 1;
        }
    }
}

#[async_trait]
impl PooledSession for MemorySession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<u64> {
        self.run(sql, params).map(|o| o.affected)
    }

    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>> {
        self.run(sql, params).map(|o| o.rows)
    }

    async fn batch(&mut self, script: &str) -> TenancyResult<()> {
        self.run(script, &[]).map(|_| ())
    }

    async fn release(mut self: Box<Self>) {
        self.finish(false);
    }

    async fn discard(mut self: Box<Self>) {
        self.finish(true);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.finish(false);
    }
}
