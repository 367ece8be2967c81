/// Driver Registry Module
///
/// The registry holds every driver able to open sessions and picks the first
/// one that accepts a locator, mirroring the classic driver-manager contract.
/// It is an explicit object shared through `Arc`, not a global.
use crate::core::db::sqlite::SqliteDriver;
use crate::core::db::{Credentials, Driver, DriverConnection};
use crate::core::DriverError;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_names())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates a registry with no drivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in drivers already registered.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SqliteDriver::new()));
        registry
    }

    /// Registers a driver. Returns `false` when a driver with the same name
    /// is already present, in which case the registry is left unchanged.
    pub fn register(&self, driver: Arc<dyn Driver>) -> bool {
        let mut drivers = match self.drivers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if drivers.iter().any(|d| d.name() == driver.name()) {
            debug!("Driver {} already registered", driver.name());
            return false;
        }
        info!("Registered driver {}", driver.name());
        drivers.push(driver);
        true
    }

    /// Names of the registered drivers, in registration order.
    pub fn driver_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.snapshot().iter().any(|d| d.name() == name)
    }

    /// Opens a session with the first registered driver accepting `locator`.
    pub fn connect(
        &self,
        locator: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        // Connect outside the lock; drivers may block on I/O.
        let drivers = self.snapshot();
        let driver = drivers
            .iter()
            .find(|d| d.accepts(locator))
            .ok_or_else(|| DriverError::new(format!("No suitable driver found for {}", locator)))?;
        debug!("Opening {} with driver {}", locator, driver.name());
        driver.connect(locator, credentials)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Driver>> {
        match self.drivers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedDriver;

    #[test]
    fn test_builtin_registry_has_sqlite() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.driver_names(), vec!["sqlite".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let registry = DriverRegistry::new();
        assert!(registry.register(Arc::new(ScriptedDriver::new())));
        assert!(!registry.register(Arc::new(ScriptedDriver::new())));
        assert_eq!(registry.driver_names().len(), 1);
    }

    #[test]
    fn test_no_suitable_driver() {
        let registry = DriverRegistry::new();
        let err = registry
            .connect("postgres://localhost/db", &Credentials::default())
            .err()
            .unwrap();
        assert!(err.message.contains("No suitable driver"));
    }

    #[test]
    fn test_connect_picks_accepting_driver() {
        let registry = DriverRegistry::with_builtin();
        registry.register(Arc::new(ScriptedDriver::new()));
        assert!(registry
            .connect("scripted:test", &Credentials::default())
            .is_ok());
        assert!(registry
            .connect("sqlite::memory:", &Credentials::default())
            .is_ok());
    }
}
