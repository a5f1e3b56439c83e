//! PostgreSQL provider integration tests.
//!
//! These tests skip unless DATABASE_URL points at a reachable database.

use db_rowpipe::config::ConnectionConfig;
use db_rowpipe::db::{DataRecord, PgCursor, PgProvider, Value};
use db_rowpipe::error::{Result, RowpipeError};
use db_rowpipe::query::{ColumnSelection, Command, ExecutionState, WalkEnd};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to create a test provider.
async fn get_test_provider() -> Option<Arc<PgProvider>> {
    let url = get_test_database_url()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    PgProvider::connect(&config).await.ok().map(Arc::new)
}

fn as_int(record: &PgCursor) -> Result<i64> {
    match record.value(0)? {
        Value::Int(n) => Ok(n),
        other => Err(RowpipeError::type_mismatch(other.to_string())),
    }
}

#[tokio::test]
async fn test_buffer_simple_select() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = Command::text(Arc::clone(&provider), "SELECT 1 AS num, 'hello' AS greeting")
        .to_buffer(&ColumnSelection::All)
        .await
        .unwrap();

    assert_eq!(result.columns().len(), 2);
    assert_eq!(result.columns()[0].name, "num");
    assert_eq!(result.columns()[1].name, "greeting");
    assert_eq!(result.rows(), &[vec![Value::Int(1), Value::from("hello")]]);

    provider.close().await;
}

#[tokio::test]
async fn test_empty_result_keeps_columns() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = Command::text(
        Arc::clone(&provider),
        "SELECT 1::int4 AS a, 'x'::text AS b WHERE 1 = 0",
    )
    .to_buffer(&ColumnSelection::names(["b"]))
    .await
    .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.columns().len(), 1);
    assert_eq!(result.columns()[0].ordinal, 1);

    provider.close().await;
}

#[tokio::test]
async fn test_numeric_temporal_uuid_and_json_columns() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = Command::text(
        Arc::clone(&provider),
        "SELECT 1.5::numeric AS amount, \
                '2024-01-01 12:00:00+00'::timestamptz AS at, \
                '2024-01-01'::date AS day, \
                'a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11'::uuid AS id, \
                '{\"a\":1}'::jsonb AS doc, \
                NULL::numeric AS missing",
    )
    .to_buffer(&ColumnSelection::All)
    .await
    .unwrap();

    assert_eq!(
        result.rows()[0],
        vec![
            Value::from("1.5"),
            Value::from("2024-01-01T12:00:00+00:00"),
            Value::from("2024-01-01"),
            Value::from("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"),
            Value::from("{\"a\":1}"),
            Value::Null,
        ]
    );

    provider.close().await;
}

#[tokio::test]
async fn test_scalar_and_parameters() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let value: i64 = Command::text(Arc::clone(&provider), "SELECT $1::int8 + 1")
        .param("n", 41)
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(value, 42);

    provider.close().await;
}

#[tokio::test]
async fn test_predicate_stop_on_large_series() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let command = Command::text(
        Arc::clone(&provider),
        "SELECT g::int8 FROM generate_series(1, 100000) AS g",
    );
    let outcome = command
        .iterate_while(|record| Ok(as_int(record)? < 3))
        .await
        .unwrap();

    assert_eq!(outcome.rows, 3);
    assert_eq!(outcome.end, WalkEnd::Stopped);
    assert_eq!(command.state(), ExecutionState::Completed);

    provider.close().await;
}

#[tokio::test]
async fn test_stream_closed_early() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let mut stream = Command::text(
        Arc::clone(&provider),
        "SELECT g::int8 FROM generate_series(1, 100000) AS g",
    )
    .to_stream(as_int)
    .unwrap();

    let first: Vec<i64> = stream.by_ref().take(3).try_collect().await.unwrap();
    assert_eq!(first, vec![1, 2, 3]);
    stream.close();

    provider.close().await;
}

#[tokio::test]
async fn test_query_error_is_cursor_fault() {
    let Some(provider) = get_test_provider().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let command = Command::text(Arc::clone(&provider), "SELECT * FROM table_that_does_not_exist");
    let err = command.to_buffer(&ColumnSelection::All).await.unwrap_err();

    assert!(matches!(err, RowpipeError::CursorFault(_)));
    assert_eq!(command.state(), ExecutionState::Failed);

    provider.close().await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_connect_with_invalid_host() {
    let config = ConnectionConfig {
        host: Some("invalid.host.that.does.not.exist.local".to_string()),
        port: 5432,
        database: Some("testdb".to_string()),
        user: Some("testuser".to_string()),
        password: Some("testpass".to_string()),
    };

    let result = PgProvider::connect(&config).await;
    assert!(matches!(result, Err(RowpipeError::Connection(_))));
}
