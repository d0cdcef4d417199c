use super::{apply_file_overrides, prepare_database_url, Settings};

use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn plain_file_path_becomes_sqlite_url() {
    assert_eq!(
        prepare_database_url("./data/test.db").expect("prepare"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn memory_and_full_sqlite_urls_pass_through() {
    assert_eq!(
        prepare_database_url("sqlite::memory:").expect("prepare"),
        "sqlite::memory:"
    );
    assert_eq!(
        prepare_database_url("sqlite://./queue.db?mode=rwc").expect("prepare"),
        "sqlite://./queue.db?mode=rwc"
    );
}

#[test]
fn blank_database_url_falls_back_to_default() {
    assert_eq!(
        prepare_database_url("   ").expect("prepare"),
        Settings::default().database_url
    );
}

#[test]
fn single_colon_sqlite_url_gains_double_slash() {
    assert_eq!(
        prepare_database_url("sqlite:data\\queue.db").expect("prepare"),
        "sqlite://data/queue.db"
    );
}

#[test]
fn non_sqlite_schemes_are_refused() {
    let err = prepare_database_url("postgres://db.internal/queue").expect_err("should fail");
    assert!(err.to_string().contains("postgres"));
}

#[test]
fn server_toml_overrides_defaults() {
    let mut settings = Settings::default();
    apply_file_overrides(
        &mut settings,
        r#"
            bind_addr = "0.0.0.0:9000"
            database_url = "sqlite://./rooms.db"
            event_buffer = 0
        "#,
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./rooms.db");
    assert_eq!(settings.event_buffer, 1);
}

#[test]
fn malformed_server_toml_is_ignored() {
    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, "bind_addr = ");
    assert_eq!(settings.server_bind, Settings::default().server_bind);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = std::env::temp_dir().join(format!("queue_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
