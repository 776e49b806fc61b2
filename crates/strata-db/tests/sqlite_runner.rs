use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use strata_common::Error;
use strata_db::{
    BackendOptions, Catalog, DirSource, Migrator, RunOptions, connect, content_hash, migrate,
};
use tokio_util::sync::CancellationToken;

const FIRST: &str = "create table t(x int);";
const SECOND: &str = "alter table t add y int;";

fn catalog(pairs: &[(&str, &str)]) -> Catalog {
    Catalog::from_pairs(pairs.iter().copied()).unwrap()
}

fn example() -> Catalog {
    catalog(&[("0001_a.sql", FIRST), ("0002_b.sql", SECOND)])
}

fn url(path: &Path) -> String {
    format!("sqlite:{}", path.display())
}

async fn run(db: &Path, catalog: Catalog, options: RunOptions) -> strata_common::Result<Vec<String>> {
    let migrator = Migrator::new(catalog, options)?;
    let mut session = connect(&url(db), &BackendOptions::default()).await?;
    migrator.run(session.as_mut(), &CancellationToken::new()).await
}

async fn run_owned(db: PathBuf) -> strata_common::Result<Vec<String>> {
    run(&db, example(), RunOptions::default()).await
}

fn tables(db: &Path) -> Vec<String> {
    let conn = Connection::open(db).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

fn recorded(db: &Path) -> Vec<(String, String)> {
    let conn = Connection::open(db).unwrap();
    let mut stmt = conn
        .prepare("SELECT id, hash FROM strata_migrations ORDER BY id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[tokio::test]
async fn first_run_applies_everything_second_run_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let applied = run(&db, example(), RunOptions::default()).await.unwrap();
    assert_eq!(applied, ["0001_a.sql", "0002_b.sql"]);

    let applied = run(&db, example(), RunOptions::default()).await.unwrap();
    assert!(applied.is_empty());

    assert!(tables(&db).contains(&"t".to_string()));
    assert_eq!(
        recorded(&db),
        [
            ("0001_a.sql".to_string(), content_hash(FIRST)),
            ("0002_b.sql".to_string(), content_hash(SECOND)),
        ]
    );
}

#[tokio::test]
async fn altered_source_is_drift() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    run(&db, example(), RunOptions::default()).await.unwrap();

    let altered = catalog(&[
        ("0001_a.sql", "create table t(x text);"),
        ("0002_b.sql", SECOND),
    ]);
    let err = run(&db, altered, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Drift { ref id, .. } if id == "0001_a.sql"), "{err:?}");
}

#[tokio::test]
async fn reformatted_source_is_not_drift() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    run(&db, example(), RunOptions::default()).await.unwrap();

    let reformatted = catalog(&[
        ("0001_a.sql", "/* initial */\nCREATE TABLE t (\n  x INT\n);\n"),
        ("0002_b.sql", "ALTER TABLE t\n  ADD y INT; -- nullable\n"),
        ("0003_c.sql", "create index t_x on t(x);"),
    ]);
    let applied = run(&db, reformatted, RunOptions::default()).await.unwrap();
    assert_eq!(applied, ["0003_c.sql"]);
}

#[tokio::test]
async fn removed_source_is_a_consistency_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    run(&db, example(), RunOptions::default()).await.unwrap();

    let err = run(&db, catalog(&[("0002_b.sql", SECOND)]), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Consistency { ref id } if id == "0001_a.sql"));
}

#[tokio::test]
async fn failing_statement_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let broken = catalog(&[
        ("0001_a.sql", FIRST),
        ("0002_b.sql", "alter table missing add y int;"),
    ]);
    let err = run(&db, broken, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Execution { ref id, .. } if id == "0002_b.sql"));

    assert!(!tables(&db).contains(&"t".to_string()));
    assert!(recorded(&db).is_empty());
}

#[tokio::test]
async fn nested_transaction_leaves_no_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let nested = catalog(&[
        ("0001_a.sql", FIRST),
        ("0002_b.sql", "begin; create table u(x int); commit;"),
    ]);
    let err = run(&db, nested, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::NestedTransaction { ref id, .. } if id == "0002_b.sql"), "{err:?}");

    assert!(recorded(&db).is_empty());
    assert!(!tables(&db).contains(&"t".to_string()));
}

#[tokio::test]
async fn commit_inside_a_migration_leaves_no_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let committing = catalog(&[
        ("0001_a.sql", FIRST),
        ("0002_b.sql", "create table u(x int); commit;"),
        ("0003_c.sql", "alter table missing add y int;"),
    ]);
    let err = run(&db, committing, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::NestedTransaction { ref id, .. } if id == "0002_b.sql"), "{err:?}");

    assert!(recorded(&db).is_empty());
    let tables = tables(&db);
    assert!(!tables.contains(&"t".to_string()));
    assert!(!tables.contains(&"u".to_string()));
}

#[tokio::test]
async fn rollback_inside_a_migration_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let rolling_back = catalog(&[
        ("0001_a.sql", FIRST),
        ("0002_b.sql", "rollback; create table u(x int);"),
        ("0003_c.sql", "create table v(x int);"),
    ]);
    let err = run(&db, rolling_back, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::NestedTransaction { ref id, .. } if id == "0002_b.sql"), "{err:?}");

    assert!(recorded(&db).is_empty());
    let tables = tables(&db);
    assert!(!tables.contains(&"t".to_string()));
    assert!(!tables.contains(&"u".to_string()));
    assert!(!tables.contains(&"v".to_string()));
}

#[tokio::test]
async fn dry_run_executes_but_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    let dry = RunOptions {
        dry_run: true,
        ..Default::default()
    };

    let applied = run(&db, example(), dry.clone()).await.unwrap();
    assert_eq!(applied, ["0001_a.sql", "0002_b.sql"]);
    assert!(recorded(&db).is_empty());
    assert!(!tables(&db).contains(&"t".to_string()));

    let broken = catalog(&[("0001_a.sql", "create tabel t(x int);")]);
    let err = run(&db, broken, dry).await.unwrap_err();
    assert_eq!(err.kind(), "execution");
}

#[tokio::test]
async fn application_id_guards_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    let with_id = |id: &str| RunOptions {
        dry_run: false,
        application_id: Some(id.to_string()),
    };

    run(&db, example(), with_id("billing")).await.unwrap();
    run(&db, example(), with_id("billing")).await.unwrap();

    let err = run(&db, example(), with_id("search")).await.unwrap_err();
    assert!(matches!(err, Error::ApplicationIdentity { .. }));
}

#[tokio::test]
async fn check_reports_pending_and_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    run(&db, catalog(&[("0001_a.sql", FIRST)]), RunOptions::default())
        .await
        .unwrap();

    let migrator = Migrator::new(example(), RunOptions::default()).unwrap();
    let mut session = connect(&url(&db), &BackendOptions::default())
        .await
        .unwrap();
    let pending: Vec<String> = migrator
        .check(session.as_mut(), &CancellationToken::new())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id().to_string())
        .collect();
    assert_eq!(pending, ["0002_b.sql"]);
    assert_eq!(recorded(&db).len(), 1);
}

#[tokio::test]
async fn check_on_a_fresh_database_creates_no_tables() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let migrator = Migrator::new(example(), RunOptions::default()).unwrap();
    let mut session = connect(&url(&db), &BackendOptions::default())
        .await
        .unwrap();
    let pending = migrator
        .check(session.as_mut(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(tables(&db).is_empty());
}

#[tokio::test]
async fn mark_applied_skips_execution() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    let cancel = CancellationToken::new();

    let migrator = Migrator::new(example(), RunOptions::default()).unwrap();
    let mut session = connect(&url(&db), &BackendOptions::default())
        .await
        .unwrap();
    migrator
        .mark_applied(session.as_mut(), "0001_a.sql", &cancel)
        .await
        .unwrap();

    assert_eq!(recorded(&db).len(), 1);
    assert!(!tables(&db).contains(&"t".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_runners_never_apply_twice() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");

    let a = tokio::spawn(run_owned(db.clone()));
    let b = tokio::spawn(run_owned(db.clone()));

    let results = [a.await.unwrap(), b.await.unwrap()];
    let applied: Vec<Vec<String>> = results.into_iter().filter_map(Result::ok).collect();

    let total: usize = applied.iter().map(Vec::len).sum();
    assert_eq!(total, 2, "each entry applied exactly once: {applied:?}");
    assert!(applied.iter().any(|ids| ids == &["0001_a.sql", "0002_b.sql"]));
    assert_eq!(recorded(&db).len(), 2);
}

#[tokio::test]
async fn migrate_reads_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    fs::write(migrations.join("0002_b.sql"), SECOND).unwrap();
    fs::write(migrations.join("0001_a.sql"), FIRST).unwrap();
    let db = dir.path().join("app.db");

    let applied = migrate(&DirSource::new(&migrations), &url(&db), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(applied, ["0001_a.sql", "0002_b.sql"]);
}
