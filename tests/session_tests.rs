//! End-to-end tests across profiles, drivers, execution and the task runner.

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use termsql::core::db::{
    ConnectionManager, DriverCatalog, DriverLoader, DriverRegistry, StatementResult, Value,
};
use termsql::core::ClientError;
use termsql::runner::{TaskOutcome, TaskRunner, TaskState, UiQueue};
use termsql::statements::extract_all;
use termsql::storage::{ConnectionProfile, FileStore, ProfileStore};
use termsql::test_utils::{Response, ScriptedDriver};

const WAIT: Duration = Duration::from_secs(5);

fn sqlite_manager() -> ConnectionManager {
    ConnectionManager::new(DriverLoader::new(
        Arc::new(DriverRegistry::with_builtin()),
        Arc::new(DriverCatalog::builtin()),
    ))
}

fn scripted_manager(driver: &ScriptedDriver) -> ConnectionManager {
    let registry = Arc::new(DriverRegistry::new());
    registry.register(Arc::new(driver.clone()));
    ConnectionManager::new(DriverLoader::new(registry, Arc::new(DriverCatalog::builtin())))
}

#[test]
fn test_profiles_persist_across_store_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("profiles.toml");

    {
        let store = ProfileStore::new(FileStore::new(&path));
        let mut work = ConnectionProfile::new("work", "jdbc:sqlite:work.db");
        work.driver = Some("org.sqlite.JDBC".to_string());
        work.user = "scott".to_string();
        work.hotkey = Some('w');
        work.order = Some(1);
        store.save(&work).unwrap();
        store
            .save(&ConnectionProfile::new("Archive", "sqlite:archive.db"))
            .unwrap();
    }

    let store = ProfileStore::new(FileStore::new(&path));
    let names: Vec<String> = store.list().unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["work", "Archive"]);

    let work = store.find_by_name("WORK").unwrap().unwrap();
    assert_eq!(work.driver.as_deref(), Some("org.sqlite.JDBC"));
    assert_eq!(work.user, "scott");
    assert_eq!(work.hotkey, Some('w'));

    let mut clash = ConnectionProfile::new("other", "sqlite:other.db");
    clash.hotkey = Some('w');
    assert!(matches!(store.save(&clash).unwrap_err(), ClientError::Save(_)));

    store.delete_by_name("archive").unwrap();
    assert!(matches!(
        store.delete_by_name("archive").unwrap_err(),
        ClientError::State(_)
    ));
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn test_sqlite_session_with_row_limit() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("session.db").display());
    let manager = sqlite_manager();
    let mut profile = ConnectionProfile::new("local", url);
    profile.driver = Some("sqlite".to_string());

    manager.establish(&profile).unwrap();
    let buffer = [
        "create table items (id integer primary key, label text);",
        "insert into items (label) values ('a'), ('b'), ('c'), ('d'), ('e');",
    ];
    let results = manager
        .execute_batch(&extract_all(&buffer, ";"), 2, || false)
        .unwrap();
    assert_eq!(results[1], StatementResult::UpdateCount(5));

    let selected = manager.execute("select label from items order by id", 2).unwrap();
    assert_eq!(selected.row_count(), Some(2));
    assert!(selected.is_truncated());

    let StatementResult::Rows { rows, .. } = manager
        .execute("select count(*) as n from items", 2)
        .unwrap()
    else {
        panic!("expected rows");
    };
    assert_eq!(rows[0].get("n"), Some(&Value::Integer(5)));

    manager.disconnect().unwrap();
    assert!(matches!(
        manager.execute("select 1", 2).unwrap_err(),
        ClientError::State(_)
    ));
}

#[test]
fn test_batch_stops_at_failing_statement() {
    let manager = sqlite_manager();
    manager
        .establish(&ConnectionProfile::new("mem", "sqlite::memory:"))
        .unwrap();

    let abort = manager
        .execute_batch(
            &[
                "create table a (x)",
                "create table a (x)",
                "insert into a values (1)",
            ],
            10,
            || false,
        )
        .unwrap_err();
    assert_eq!(abort.completed.len(), 1);
    assert!(!abort.is_cancelled());
    assert!(abort.cause.vendor_code().is_some());

    let StatementResult::Rows { rows, .. } = manager.execute("select count(*) as n from a", 10).unwrap() else {
        panic!("expected rows");
    };
    assert_eq!(rows[0].get("n"), Some(&Value::Integer(0)));
}

#[test]
fn test_establish_twice_and_disconnect_without_connection() {
    let manager = sqlite_manager();
    assert!(matches!(manager.disconnect().unwrap_err(), ClientError::State(_)));

    let profile = ConnectionProfile::new("mem", "sqlite::memory:");
    manager.establish(&profile).unwrap();
    assert!(matches!(
        manager.establish(&profile).unwrap_err(),
        ClientError::State(_)
    ));
    manager.disconnect().unwrap();
}

#[test]
fn test_unknown_locator_is_a_connection_error() {
    let manager = sqlite_manager();
    let err = manager
        .establish(&ConnectionProfile::new("pg", "postgres://localhost/db"))
        .unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
    assert!(err.to_string().contains("No suitable driver"));
    assert!(!manager.is_connected());
}

#[test]
fn test_cancelled_batch_runs_no_further_statements() {
    let (driver, gate) = ScriptedDriver::new()
        .respond("second", Response::Updated(1))
        .gate("first");
    let manager = Arc::new(scripted_manager(&driver));
    manager
        .establish(&ConnectionProfile::new("scratch", "scripted:scratch"))
        .unwrap();

    let queue = Arc::new(UiQueue::new());
    let runner = TaskRunner::new(queue.clone()).unwrap();
    let (tx, rx) = channel();

    let handle = {
        let manager = manager.clone();
        runner.start(
            "batch",
            move |token| {
                manager
                    .execute_batch(&["first", "second"], 10, || token.is_cancelled())
                    .map_err(ClientError::from)
            },
            move |outcome| tx.send(format!("{:?}", outcome)).unwrap(),
        )
    };

    gate.started.recv_timeout(WAIT).unwrap();
    assert!(runner.cancel(&handle));
    gate.release.send(()).unwrap();

    assert!(queue.pump(WAIT));
    assert_eq!(rx.try_recv().unwrap(), "Interrupted");
    assert_eq!(handle.state(), TaskState::Interrupted);
    assert_eq!(driver.executed(), vec!["first".to_string()]);
    assert!(manager.is_connected());
}

#[test]
fn test_failed_task_reports_vendor_code() {
    let driver = ScriptedDriver::new().respond("bad", Response::fail("syntax error", 904));
    let manager = Arc::new(scripted_manager(&driver));
    manager
        .establish(&ConnectionProfile::new("scratch", "scripted:scratch"))
        .unwrap();

    let queue = Arc::new(UiQueue::new());
    let runner = TaskRunner::new(queue.clone()).unwrap();
    let (tx, rx) = channel();
    {
        let manager = manager.clone();
        runner.start(
            "bad",
            move |_| manager.execute("bad", 10),
            move |outcome| {
                let code = match outcome {
                    TaskOutcome::Failed(e) => e.vendor_code(),
                    _ => None,
                };
                tx.send(code).unwrap();
            },
        );
    }

    assert!(queue.pump(WAIT));
    assert_eq!(rx.try_recv().unwrap(), Some(904));
}
