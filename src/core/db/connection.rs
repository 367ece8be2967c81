/// Connection Management Module
///
/// Owns the single live database connection. The connection sits in a
/// one-place slot: every operation checks and swaps the slot's state under a
/// short lock and never waits for another caller, so a second `establish`,
/// or an `execute` with nothing connected, fails immediately.
use crate::core::db::query::{self, BatchAbort};
use crate::core::db::{DriverConnection, DriverLoader, StatementResult};
use crate::core::{ClientError, Result};
use crate::storage::ConnectionProfile;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect is in progress for the named profile.
    Connecting(String),
    /// Connected to the named profile.
    Connected(String),
}

enum Slot {
    Empty,
    Connecting(String),
    Idle {
        profile: String,
        conn: Box<dyn DriverConnection>,
    },
    /// The connection is lent out to a running statement.
    Busy(String),
}

/// Connection manager for the single active database session
pub struct ConnectionManager {
    loader: DriverLoader,
    slot: Mutex<Slot>,
}

impl ConnectionManager {
    pub fn new(loader: DriverLoader) -> Self {
        ConnectionManager {
            loader,
            slot: Mutex::new(Slot::Empty),
        }
    }

    pub fn loader(&self) -> &DriverLoader {
        &self.loader
    }

    /// Opens a connection for `profile` and makes it the active one.
    ///
    /// # Errors
    ///
    /// `ClientError::State` if a connection already exists (or is being
    /// opened); otherwise whatever the driver loader reports. A failed
    /// connect leaves the manager disconnected.
    pub fn establish(&self, profile: &ConnectionProfile) -> Result<()> {
        {
            let mut slot = self.lock()?;
            if !matches!(*slot, Slot::Empty) {
                return Err(ClientError::State(
                    "already connected, must disconnect first".to_string(),
                ));
            }
            *slot = Slot::Connecting(profile.name.clone());
        }

        let opened = self.loader.open_connection(profile);

        let mut slot = self.lock()?;
        match opened {
            Ok(conn) => {
                *slot = Slot::Idle {
                    profile: profile.name.clone(),
                    conn,
                };
                info!("Connection established for {}", profile.name);
                Ok(())
            }
            Err(e) => {
                *slot = Slot::Empty;
                warn!("Failed to connect {}: {}", profile.name, e);
                Err(e)
            }
        }
    }

    /// Closes the active connection.
    ///
    /// The slot is cleared even when the driver reports an error on close.
    pub fn disconnect(&self) -> Result<()> {
        let (profile, conn) = {
            let mut slot = self.lock()?;
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Idle { profile, conn } => (profile, conn),
                Slot::Empty => {
                    return Err(ClientError::State(
                        "not connected, must establish first".to_string(),
                    ))
                }
                busy => {
                    *slot = busy;
                    return Err(ClientError::State(
                        "connection is busy, wait for the running statement".to_string(),
                    ));
                }
            }
        };
        info!("Disconnecting {}", profile);
        conn.close()?;
        Ok(())
    }

    /// Executes one statement on the active connection.
    pub fn execute(&self, sql: &str, row_limit: usize) -> Result<StatementResult> {
        self.with_connection(|conn| query::execute(conn, sql, row_limit))
    }

    /// Executes `statements` in order on the active connection, checking
    /// `cancelled` before each one.
    pub fn execute_batch<S, C>(
        &self,
        statements: &[S],
        row_limit: usize,
        cancelled: C,
    ) -> std::result::Result<Vec<StatementResult>, BatchAbort>
    where
        S: AsRef<str>,
        C: Fn() -> bool,
    {
        self.with_connection(|conn| Ok(query::execute_batch(conn, statements, row_limit, cancelled)))
            .unwrap_or_else(|cause| {
                Err(BatchAbort {
                    completed: Vec::new(),
                    cause,
                })
            })
    }

    pub fn state(&self) -> ConnectionState {
        match self.lock() {
            Ok(slot) => match &*slot {
                Slot::Empty => ConnectionState::Disconnected,
                Slot::Connecting(name) => ConnectionState::Connecting(name.clone()),
                Slot::Idle { profile, .. } | Slot::Busy(profile) => {
                    ConnectionState::Connected(profile.clone())
                }
            },
            Err(_) => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    /// Name of the profile the active connection was built from.
    pub fn current_profile(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Connected(name) => Some(name),
            _ => None,
        }
    }

    /// Lends the connection to `work`, putting it back afterwards.
    fn with_connection<T>(
        &self,
        work: impl FnOnce(&mut dyn DriverConnection) -> Result<T>,
    ) -> Result<T> {
        let (profile, mut conn) = {
            let mut slot = self.lock()?;
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Idle { profile, conn } => {
                    *slot = Slot::Busy(profile.clone());
                    (profile, conn)
                }
                Slot::Empty => return Err(ClientError::State("no connection".to_string())),
                other => {
                    *slot = other;
                    return Err(ClientError::State("connection is busy".to_string()));
                }
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(conn.as_mut())));

        let mut slot = self.lock()?;
        *slot = Slot::Idle { profile, conn };
        drop(slot);
        match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                warn!("Statement panicked, connection returned to idle");
                panic::resume_unwind(payload)
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| ClientError::State("connection slot lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{DriverCatalog, DriverRegistry};
    use crate::core::DriverError;
    use crate::test_utils::{Response, ScriptedDriver};
    use std::sync::Arc;

    fn manager_with(driver: &ScriptedDriver) -> ConnectionManager {
        let registry = Arc::new(DriverRegistry::new());
        registry.register(Arc::new(driver.clone()));
        ConnectionManager::new(DriverLoader::new(registry, Arc::new(DriverCatalog::builtin())))
    }

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("scratch", "scripted:scratch")
    }

    #[test]
    fn test_establish_then_disconnect() {
        let driver = ScriptedDriver::new();
        let manager = manager_with(&driver);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.establish(&profile()).unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.current_profile(), Some("scratch".to_string()));

        manager.disconnect().unwrap();
        assert!(!manager.is_connected());
        assert_eq!(driver.connects(), 1);
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn test_establish_twice_fails() {
        let driver = ScriptedDriver::new();
        let manager = manager_with(&driver);
        manager.establish(&profile()).unwrap();

        let err = manager.establish(&profile()).unwrap_err();
        assert!(matches!(err, ClientError::State(_)));
        assert_eq!(driver.connects(), 1);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_disconnect_without_connection_fails() {
        let manager = manager_with(&ScriptedDriver::new());
        let err = manager.disconnect().unwrap_err();
        assert!(matches!(err, ClientError::State(_)));
    }

    #[test]
    fn test_execute_without_connection_fails() {
        let manager = manager_with(&ScriptedDriver::new());
        assert!(matches!(
            manager.execute("select 1", 10).unwrap_err(),
            ClientError::State(_)
        ));
        let abort = manager.execute_batch(&["select 1"], 10, || false).unwrap_err();
        assert!(abort.completed.is_empty());
        assert!(matches!(abort.cause, ClientError::State(_)));
    }

    #[test]
    fn test_failed_establish_leaves_slot_empty() {
        let driver = ScriptedDriver::new()
            .refuse_connections(DriverError::with_code("login denied", 1017));
        let manager = manager_with(&driver);

        let err = manager.establish(&profile()).unwrap_err();
        assert_eq!(err.vendor_code(), Some(1017));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // The slot is free again, so a later attempt is allowed to try.
        assert!(matches!(
            manager.establish(&profile()).unwrap_err(),
            ClientError::Connection(_)
        ));
    }

    #[test]
    fn test_connection_survives_statement_failure() {
        let driver = ScriptedDriver::new()
            .respond("bad", Response::fail("syntax error", 1))
            .respond("good", Response::Updated(2));
        let manager = manager_with(&driver);
        manager.establish(&profile()).unwrap();

        assert!(manager.execute("bad", 10).is_err());
        assert_eq!(
            manager.execute("good", 10).unwrap(),
            StatementResult::UpdateCount(2)
        );
    }

    #[test]
    fn test_panicking_statement_releases_connection() {
        let driver = ScriptedDriver::new()
            .respond("boom", Response::Panic("driver crashed".to_string()))
            .respond("after", Response::Updated(1));
        let manager = manager_with(&driver);
        manager.establish(&profile()).unwrap();

        let crashed = std::panic::catch_unwind(AssertUnwindSafe(|| manager.execute("boom", 10)));
        assert!(crashed.is_err());

        assert_eq!(manager.state(), ConnectionState::Connected("scratch".to_string()));
        assert_eq!(
            manager.execute("after", 10).unwrap(),
            StatementResult::UpdateCount(1)
        );
        manager.disconnect().unwrap();
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn test_busy_connection_rejects_other_callers() {
        let (driver, gate) = ScriptedDriver::new().gate("slow");
        let manager = Arc::new(manager_with(&driver));
        manager.establish(&profile()).unwrap();

        let worker = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.execute("slow", 10))
        };
        gate.started.recv().unwrap();

        assert!(matches!(
            manager.execute("other", 10).unwrap_err(),
            ClientError::State(_)
        ));
        assert!(matches!(manager.disconnect().unwrap_err(), ClientError::State(_)));
        assert!(manager.is_connected());

        gate.release.send(()).unwrap();
        assert!(worker.join().unwrap().is_ok());
        manager.disconnect().unwrap();
    }
}
