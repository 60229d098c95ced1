//! Scripted in-process driver for tests.
//!
//! [`ScriptedConnector`] hands out [`ScriptedConnection`]s whose behavior is
//! controlled from the test: connect attempts can be failed, statements
//! matching a substring can be made to fail with a given class of error, and
//! live connections can be killed to simulate a server restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::connection::{Connector, DbConnection};
use crate::error::{DbError, QueryErrorKind, Result};
use crate::health::PROBE_QUERY;
use crate::types::{Row, RowSet, SqlParam};

/// Failure injected into a statement or a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Syntax,
    DuplicateKey,
    ForeignKey,
    ConnectionLost,
    Other,
}

impl Failure {
    fn to_error(self) -> DbError {
        match self {
            Failure::Syntax => DbError::query(
                QueryErrorKind::Syntax,
                "You have an error in your SQL syntax",
            ),
            Failure::DuplicateKey => {
                DbError::query(QueryErrorKind::DuplicateKey, "Duplicate entry for key 'PRIMARY'")
            }
            Failure::ForeignKey => DbError::query(
                QueryErrorKind::ForeignKey,
                "Cannot add or update a child row: a foreign key constraint fails",
            ),
            Failure::ConnectionLost => DbError::connection_lost("MySQL server has gone away"),
            Failure::Other => DbError::query(QueryErrorKind::Other, "Lock wait timeout exceeded"),
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    id: u64,
    alive: AtomicBool,
    closed: AtomicBool,
    executed: Mutex<Vec<String>>,
}

impl ConnectionState {
    fn new(id: u64) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    connect_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
    next_id: AtomicU64,
    statement_rules: Mutex<Vec<(String, Failure)>>,
    statement_log: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    latency: Mutex<Duration>,
    session_failures: Mutex<VecDeque<Failure>>,
}

impl Script {
    fn rule_for(&self, query: &str) -> Option<Failure> {
        self.statement_rules
            .lock()
            .iter()
            .find(|(needle, _)| query.contains(needle.as_str()))
            .map(|(_, failure)| *failure)
    }
}

/// A connection driven by a [`ScriptedConnector`], or standalone.
#[derive(Debug)]
pub struct ScriptedConnection {
    state: Arc<ConnectionState>,
    script: Option<Arc<Script>>,
    latency: Duration,
}

impl ScriptedConnection {
    /// A standalone connection that answers every statement.
    pub fn healthy() -> Self {
        Self {
            state: Arc::new(ConnectionState::new(0)),
            script: None,
            latency: Duration::ZERO,
        }
    }

    /// Delays every statement by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Breaks the connection; later statements fail with a connection loss.
    pub fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Statements run on this connection, probes included.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }
}

#[async_trait]
impl DbConnection for ScriptedConnection {
    async fn execute(&mut self, query: &str, _params: &[SqlParam]) -> Result<RowSet> {
        let latency = match &self.script {
            Some(script) => *script.latency.lock(),
            None => self.latency,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.state.alive.load(Ordering::SeqCst) {
            return Err(DbError::connection_lost("Lost connection to MySQL server"));
        }

        self.state.executed.lock().push(query.to_string());

        if let Some(script) = &self.script {
            if query.starts_with("SET ") {
                if let Some(failure) = script.session_failures.lock().pop_front() {
                    return Err(failure.to_error());
                }
            }
            if query != PROBE_QUERY {
                script.statement_log.lock().push(query.to_string());
            }
            if let Some(failure) = script.rule_for(query) {
                if failure == Failure::ConnectionLost {
                    self.state.alive.store(false, Ordering::SeqCst);
                }
                return Err(failure.to_error());
            }
        }

        let mut row = Row::new();
        row.insert("connection_id".into(), json!(self.state.id));
        row.insert("query".into(), json!(query));
        Ok(RowSet::from_rows(vec![row]))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector whose behavior is scripted by the test.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` connect attempts with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        self.script.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fails the next session-default statement (`SET ...`) with `failure`.
    pub fn fail_next_session_setup(&self, failure: Failure) {
        self.script.session_failures.lock().push_back(failure);
    }

    /// Every statement containing `needle` fails with `failure`.
    pub fn fail_statements_containing(&self, needle: impl Into<String>, failure: Failure) {
        self.script.statement_rules.lock().push((needle.into(), failure));
    }

    /// Delays every statement on every connection.
    pub fn set_latency(&self, latency: Duration) {
        *self.script.latency.lock() = latency;
    }

    /// Breaks every connection opened so far.
    pub fn kill_all(&self) {
        for conn in self.script.connections.lock().iter() {
            conn.alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.script.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.script.connections.lock().len()
    }

    pub fn closed(&self) -> usize {
        self.script
            .connections
            .lock()
            .iter()
            .filter(|c| c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// How many times a non-probe statement containing `needle` ran.
    pub fn executions_of(&self, needle: &str) -> usize {
        self.script
            .statement_log
            .lock()
            .iter()
            .filter(|q| q.contains(needle))
            .count()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>> {
        let script = &self.script;
        script.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failed = script
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DbError::connection_lost("Connection refused"));
        }

        let id = script.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(ConnectionState::new(id));
        script.connections.lock().push(Arc::clone(&state));

        Ok(Box::new(ScriptedConnection {
            state,
            script: Some(Arc::clone(&self.script)),
            latency: Duration::ZERO,
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
