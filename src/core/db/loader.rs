/// Driver Loader Module
///
/// Resolves the configured driver library paths, instantiates drivers by
/// name through a [`DriverFactory`], and registers them with the
/// [`DriverRegistry`] behind a delegating [`DriverShim`].
///
/// The library resolved for a connect is installed as the thread's ambient
/// library while the registry opens the session, and the previous ambient
/// library is put back afterwards on every path.
use crate::storage::ConnectionProfile;
use crate::core::db::{Credentials, Driver, DriverConnection, DriverRegistry};
use crate::core::{ClientError, DriverError, DriverLoadError, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// An ordered set of resolved driver library locations.
///
/// An empty library means "use whatever is already registered".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverLibrary {
    entries: Vec<PathBuf>,
}

impl DriverLibrary {
    /// The ambient library: no extra locations.
    pub fn ambient() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn is_ambient(&self) -> bool {
        self.entries.is_empty()
    }
}

thread_local! {
    static ACTIVE_LIBRARY: RefCell<DriverLibrary> = RefCell::new(DriverLibrary::ambient());
}

/// The library currently active on this thread.
pub fn active_library() -> DriverLibrary {
    ACTIVE_LIBRARY.with(|active| active.borrow().clone())
}

/// Restores the previously active library when dropped.
struct ActiveLibraryGuard {
    previous: Option<DriverLibrary>,
}

impl ActiveLibraryGuard {
    fn install(library: DriverLibrary) -> Self {
        let previous = ACTIVE_LIBRARY.with(|active| active.replace(library));
        ActiveLibraryGuard {
            previous: Some(previous),
        }
    }
}

impl Drop for ActiveLibraryGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            ACTIVE_LIBRARY.with(|active| {
                active.replace(previous);
            });
        }
    }
}

/// Converts each path into a loadable library reference.
///
/// Relative paths are anchored at the current directory. Blank entries and
/// entries containing NUL bytes are malformed.
pub fn resolve_library<P: AsRef<Path>>(paths: &[P]) -> Result<DriverLibrary> {
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let raw = path.to_string_lossy();
        if raw.trim().is_empty() {
            return Err(DriverLoadError::MalformedPath {
                entry: raw.into_owned(),
                reason: "path is blank".to_string(),
            }
            .into());
        }
        if raw.contains('\0') {
            return Err(DriverLoadError::MalformedPath {
                entry: raw.replace('\0', "\\0"),
                reason: "path contains a NUL byte".to_string(),
            }
            .into());
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        entries.push(absolute);
    }
    Ok(DriverLibrary { entries })
}

/// Builds driver instances by name. This is where "load the named driver
/// from these libraries" happens.
pub trait DriverFactory: Send + Sync {
    fn instantiate(
        &self,
        name: &str,
        library: &DriverLibrary,
    ) -> std::result::Result<Box<dyn Driver>, DriverLoadError>;
}

type Constructor =
    Arc<dyn Fn(&DriverLibrary) -> std::result::Result<Box<dyn Driver>, String> + Send + Sync>;

/// Default factory: a table of driver names to constructors.
pub struct DriverCatalog {
    constructors: RwLock<BTreeMap<String, Constructor>>,
}

impl DriverCatalog {
    /// A catalog containing the drivers compiled into this binary.
    pub fn builtin() -> Self {
        let catalog = DriverCatalog {
            constructors: RwLock::new(BTreeMap::new()),
        };
        for name in ["sqlite", "org.sqlite.JDBC"] {
            catalog.add(name, |_| {
                Ok(Box::new(crate::core::db::sqlite::SqliteDriver::new()) as Box<dyn Driver>)
            });
        }
        catalog
    }

    /// Adds or replaces the constructor for `name`.
    pub fn add<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&DriverLibrary) -> std::result::Result<Box<dyn Driver>, String> + Send + Sync + 'static,
    {
        let mut constructors = match self.constructors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        match self.constructors.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}

impl DriverFactory for DriverCatalog {
    fn instantiate(
        &self,
        name: &str,
        library: &DriverLibrary,
    ) -> std::result::Result<Box<dyn Driver>, DriverLoadError> {
        let constructor = {
            let constructors = match self.constructors.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            constructors
                .get(name)
                .cloned()
                .ok_or_else(|| DriverLoadError::UnknownDriver(name.to_string()))?
        };
        constructor(library).map_err(|reason| DriverLoadError::Instantiation {
            name: name.to_string(),
            reason,
        })
    }
}

/// Registers a loaded driver under the name it was requested by, forwarding
/// every capability call unchanged to the loaded instance.
pub struct DriverShim {
    name: String,
    inner: Box<dyn Driver>,
}

impl DriverShim {
    pub fn new(name: impl Into<String>, inner: Box<dyn Driver>) -> Self {
        DriverShim {
            name: name.into(),
            inner,
        }
    }
}

impl Driver for DriverShim {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, locator: &str) -> bool {
        self.inner.accepts(locator)
    }

    fn connect(
        &self,
        locator: &str,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn DriverConnection>, DriverError> {
        self.inner.connect(locator, credentials)
    }
}

/// Opens physical connections for connection profiles.
pub struct DriverLoader {
    registry: Arc<DriverRegistry>,
    factory: Arc<dyn DriverFactory>,
    classpath: Vec<PathBuf>,
}

impl DriverLoader {
    pub fn new(registry: Arc<DriverRegistry>, factory: Arc<dyn DriverFactory>) -> Self {
        DriverLoader {
            registry,
            factory,
            classpath: Vec::new(),
        }
    }

    /// Sets the driver library paths resolved on every connect.
    pub fn with_classpath(mut self, classpath: Vec<PathBuf>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Instantiates `name` through `library` and registers it behind a shim.
    pub fn register_driver(&self, name: &str, library: &DriverLibrary) -> Result<()> {
        if self.registry.is_registered(name) {
            debug!("Driver {} already available", name);
            return Ok(());
        }
        let driver = self.factory.instantiate(name, library).map_err(|e| {
            warn!("Failed to load driver {}: {}", name, e);
            ClientError::DriverLoad(e)
        })?;
        self.registry
            .register(Arc::new(DriverShim::new(name, driver)));
        Ok(())
    }

    /// Opens a connection for `profile`.
    ///
    /// The profile's password is used as-is; callers prompt for it
    /// beforehand when `auto_login` is off.
    pub fn open_connection(&self, profile: &ConnectionProfile) -> Result<Box<dyn DriverConnection>> {
        let _ambient = ActiveLibraryGuard::install(DriverLibrary::ambient());

        let library = if self.classpath.is_empty() {
            DriverLibrary::ambient()
        } else {
            resolve_library(&self.classpath)?
        };

        if let Some(driver) = profile.driver.as_deref().filter(|d| !d.trim().is_empty()) {
            self.register_driver(driver, &library)?;
        }

        let _scoped = ActiveLibraryGuard::install(library);
        let credentials = Credentials::new(profile.user.clone(), profile.password.clone());
        let conn = self.registry.connect(&profile.url, &credentials)?;
        info!("Connected to profile {}", profile.name);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedDriver;

    fn loader_with_scripted() -> (DriverLoader, Arc<DriverCatalog>) {
        let catalog = Arc::new(DriverCatalog::builtin());
        catalog.add("scripted", |_| Ok(Box::new(ScriptedDriver::new()) as Box<dyn Driver>));
        let loader = DriverLoader::new(Arc::new(DriverRegistry::new()), catalog.clone());
        (loader, catalog)
    }

    fn profile(url: &str, driver: Option<&str>) -> ConnectionProfile {
        let mut profile = ConnectionProfile::new("test", url);
        profile.driver = driver.map(String::from);
        profile
    }

    #[test]
    fn test_resolve_empty_is_ambient() {
        let library = resolve_library::<PathBuf>(&[]).unwrap();
        assert!(library.is_ambient());
    }

    #[test]
    fn test_resolve_makes_paths_absolute() {
        let library = resolve_library(&["drivers/ext.so", "/opt/ext.so"]).unwrap();
        assert_eq!(library.entries().len(), 2);
        assert!(library.entries().iter().all(|p| p.is_absolute()));
        assert_eq!(library.entries()[1], PathBuf::from("/opt/ext.so"));
    }

    #[test]
    fn test_resolve_rejects_malformed_entries() {
        let err = resolve_library(&["ok.so", "  "]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::DriverLoad(DriverLoadError::MalformedPath { .. })
        ));
        assert!(resolve_library(&["bad\0.so"]).is_err());
    }

    #[test]
    fn test_register_unknown_driver_fails() {
        let (loader, _) = loader_with_scripted();
        let err = loader
            .register_driver("com.example.Missing", &DriverLibrary::ambient())
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::DriverLoad(DriverLoadError::UnknownDriver(_))
        ));
    }

    #[test]
    fn test_register_constructor_failure() {
        let (loader, catalog) = loader_with_scripted();
        catalog.add("broken", |_| Err("no default constructor".to_string()));
        let err = loader
            .register_driver("broken", &DriverLibrary::ambient())
            .unwrap_err();
        assert!(err.to_string().contains("no default constructor"));
    }

    #[test]
    fn test_registered_driver_is_wrapped_and_delegates() {
        let (loader, _) = loader_with_scripted();
        loader
            .register_driver("scripted", &DriverLibrary::ambient())
            .unwrap();
        assert!(loader.registry().is_registered("scripted"));
        assert!(loader
            .registry()
            .connect("scripted:any", &Credentials::default())
            .is_ok());
    }

    #[test]
    fn test_open_connection_registers_named_driver() {
        let (loader, _) = loader_with_scripted();
        let conn = loader.open_connection(&profile("scripted:db", Some("scripted")));
        assert!(conn.is_ok());
    }

    #[test]
    fn test_open_connection_without_driver_uses_registry() {
        let loader = DriverLoader::new(
            Arc::new(DriverRegistry::with_builtin()),
            Arc::new(DriverCatalog::builtin()),
        );
        assert!(loader.open_connection(&profile("sqlite::memory:", None)).is_ok());
        let err = loader
            .open_connection(&profile("oracle:thin@host", None))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[test]
    fn test_open_connection_restores_active_library() {
        let (loader, _) = loader_with_scripted();
        let loader = loader.with_classpath(vec![PathBuf::from("/opt/drivers/x.so")]);

        let outer = resolve_library(&["/outer.so"]).unwrap();
        let _outer = ActiveLibraryGuard::install(outer.clone());

        // Fails at connect time: nothing accepts this locator.
        assert!(loader.open_connection(&profile("nothing:here", None)).is_err());
        assert_eq!(active_library(), outer);

        // Fails at registration time.
        assert!(loader
            .open_connection(&profile("scripted:db", Some("missing")))
            .is_err());
        assert_eq!(active_library(), outer);

        assert!(loader
            .open_connection(&profile("scripted:db", Some("scripted")))
            .is_ok());
        assert_eq!(active_library(), outer);
    }

    #[test]
    fn test_open_connection_rejects_malformed_classpath() {
        let (loader, _) = loader_with_scripted();
        let loader = loader.with_classpath(vec![PathBuf::from("")]);
        let err = loader
            .open_connection(&profile("scripted:db", Some("scripted")))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ClientError::DriverLoad(DriverLoadError::MalformedPath { .. })
        ));
    }
}
