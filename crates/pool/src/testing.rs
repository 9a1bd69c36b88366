//! Testing utilities: an in-memory [`Connector`] with failure injection.
//!
//! `MockConnector` is cheap to clone; every clone shares the same counters,
//! so a test can keep one handle while the pool owns another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::ConnectionConfig;
use crate::error::ConnectError;
use crate::lifecycle::Connector;

/// Session produced by [`MockConnector`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    key: String,
    cwd: String,
    alive: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the config the connection was opened for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current remote working directory.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Simulate a borrower changing directory.
    pub fn set_cwd(&mut self, path: impl Into<String>) {
        self.cwd = path.into();
    }

    /// Simulate the server dropping this session.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Snapshot of what a [`MockConnector`] has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Successful connects.
    pub connects: u64,
    /// Connects that were failed on purpose.
    pub failed_connects: u64,
    /// Calls to `default_dir`.
    pub default_dir_calls: u64,
    /// Calls to `is_alive`.
    pub alive_checks: u64,
    /// Calls to `reset`.
    pub resets: u64,
    /// Connections torn down (including failed teardowns).
    pub terminated: u64,
    /// Connections currently open.
    pub live: u64,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    home: String,
    connect_delay: Option<Duration>,
    fail_connects: u32,
    fail_terminates: bool,
    fail_resets: bool,
    live: HashMap<u64, Arc<AtomicBool>>,
    terminated_ids: Vec<u64>,
    stats: MockStats,
}

/// In-memory connector for tests.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 0,
                home: "/home/mock".to_owned(),
                connect_delay: None,
                fail_connects: 0,
                fail_terminates: false,
                fail_resets: false,
                live: HashMap::new(),
                terminated_ids: Vec::new(),
                stats: MockStats::default(),
            })),
        }
    }

    /// Directory new sessions start in.
    #[must_use]
    pub fn with_home(self, home: impl Into<String>) -> Self {
        self.state.lock().home = home.into();
        self
    }

    /// Delay applied to every connect.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = Some(delay);
        self
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    pub fn fail_terminates(&self, fail: bool) {
        self.state.lock().fail_terminates = fail;
    }

    pub fn fail_resets(&self, fail: bool) {
        self.state.lock().fail_resets = fail;
    }

    /// Mark one open connection dead.
    pub fn kill(&self, id: u64) {
        if let Some(alive) = self.state.lock().live.get(&id) {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Mark every open connection dead.
    pub fn kill_all(&self) {
        for alive in self.state.lock().live.values() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().stats.clone()
    }

    /// Ids of terminated connections, in termination order.
    pub fn terminated_ids(&self) -> Vec<u64> {
        self.state.lock().terminated_ids.clone()
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MockConnection, ConnectError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            state.stats.failed_connects += 1;
            return Err(ConnectError::transport(format!(
                "connection to {}:{} refused",
                config.host(),
                config.port()
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        let alive = Arc::new(AtomicBool::new(true));
        state.live.insert(id, Arc::clone(&alive));
        state.stats.connects += 1;
        state.stats.live += 1;

        Ok(MockConnection {
            id,
            key: config.key().to_owned(),
            cwd: state.home.clone(),
            alive,
        })
    }

    async fn default_dir(&self, conn: &mut MockConnection) -> Result<String, ConnectError> {
        self.state.lock().stats.default_dir_calls += 1;
        Ok(conn.cwd.clone())
    }

    async fn is_alive(&self, conn: &MockConnection) -> bool {
        self.state.lock().stats.alive_checks += 1;
        conn.alive.load(Ordering::SeqCst)
    }

    async fn reset(&self, conn: &mut MockConnection, path: &str) -> Result<(), ConnectError> {
        let mut state = self.state.lock();
        state.stats.resets += 1;
        if state.fail_resets || !conn.alive.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        path.clone_into(&mut conn.cwd);
        Ok(())
    }

    async fn terminate(&self, conn: MockConnection) -> Result<(), ConnectError> {
        let mut state = self.state.lock();
        conn.alive.store(false, Ordering::SeqCst);
        if state.live.remove(&conn.id).is_some() {
            state.stats.live -= 1;
        }
        state.stats.terminated += 1;
        state.terminated_ids.push(conn.id);
        if state.fail_terminates {
            return Err(ConnectError::transport("teardown failed"));
        }
        Ok(())
    }
}
