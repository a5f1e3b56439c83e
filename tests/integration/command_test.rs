//! Command façade integration tests.
//!
//! Drives every caller-facing operation over the in-memory provider and
//! checks read counts, cursor release and the execution state machine.

use db_rowpipe::db::{DataRecord, MemoryProvider, MemoryResult, Value};
use db_rowpipe::error::{Result, RowpipeError};
use db_rowpipe::query::{Column, ColumnSelection, Command, ExecutionState, WalkEnd};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn users(n: i64) -> MemoryResult {
    MemoryResult::new(["id", "email", "name"]).with_rows((1..=n).map(|i| {
        vec![
            Value::Int(i),
            Value::String(format!("user{i}@example.com")),
            Value::String(format!("User {i}")),
        ]
    }))
}

fn provider(result: MemoryResult) -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new(result))
}

fn id_of(record: &db_rowpipe::db::MemoryCursor) -> Result<i64> {
    match record.value(0)? {
        Value::Int(id) => Ok(id),
        other => Err(RowpipeError::type_mismatch(other.to_string())),
    }
}

/// Scenario: buffering a result of N rows
/// Then the buffer holds N rows and one column entry per resolved column
#[tokio::test]
async fn test_buffer_holds_every_row() {
    for n in [0, 1, 25] {
        let result = Command::text(provider(users(n)), "SELECT * FROM users")
            .to_buffer(&ColumnSelection::All)
            .await
            .unwrap();

        assert_eq!(result.row_count(), n as usize);
        assert_eq!(result.columns().len(), 3);
        assert!(result.is_complete());
    }
}

#[tokio::test]
async fn test_buffer_by_ordinals_with_names() {
    let selection = ColumnSelection::Ordinals {
        ordinals: vec![2, 0],
        names: Some(vec!["display".to_string(), "key".to_string()]),
    };
    let result = Command::text(provider(users(2)), "SELECT * FROM users")
        .to_buffer(&selection)
        .await
        .unwrap();

    assert_eq!(
        result.columns(),
        &[Column::new(2, "display"), Column::new(0, "key")]
    );
    assert_eq!(result.get(1, "key"), Some(&Value::Int(2)));
}

#[tokio::test]
async fn test_buffer_mismatched_names_fails_before_reading() {
    let provider = provider(users(3));
    let selection = ColumnSelection::Ordinals {
        ordinals: vec![0, 1],
        names: Some(vec!["only".to_string()]),
    };
    let command = Command::text(Arc::clone(&provider), "SELECT * FROM users");
    let err = command.to_buffer(&selection).await.unwrap_err();

    assert!(matches!(err, RowpipeError::InvalidArgument(_)));
    assert_eq!(provider.stats().reads(), 0);
    assert_eq!(provider.stats().closes(), 1);
    assert_eq!(command.state(), ExecutionState::Failed);
}

/// Scenario: a requested column is missing from the live schema
/// Then resolution fails with UnknownColumn and no row is read
#[tokio::test]
async fn test_unknown_column_reads_nothing() {
    let provider = provider(users(3));
    let err = Command::text(Arc::clone(&provider), "SELECT * FROM users")
        .to_buffer(&ColumnSelection::names(["email", "phone"]))
        .await
        .unwrap_err();

    assert_eq!(err, RowpipeError::unknown_column("phone"));
    assert_eq!(provider.stats().reads(), 0);
}

#[tokio::test]
async fn test_buffer_fault_returns_no_partial_result() {
    let provider = provider(users(10).fail_on_read(6));
    let command = Command::text(Arc::clone(&provider), "SELECT * FROM users");
    let err = command.to_buffer(&ColumnSelection::All).await.unwrap_err();

    assert!(matches!(err, RowpipeError::CursorFault(_)));
    assert_eq!(provider.stats().closes(), 1);
    assert_eq!(command.state(), ExecutionState::Failed);
}

/// Scenario: the predicate asks to stop on row k
/// Then exactly k rows are delivered and at most k reads happen
#[tokio::test]
async fn test_predicate_stop_bounds_reads() {
    for k in [1, 4, 10] {
        let provider = provider(users(10));
        let mut delivered = 0;
        let outcome = Command::text(Arc::clone(&provider), "SELECT * FROM users")
            .iterate_while(|record| {
                delivered += 1;
                Ok(id_of(record)? < k)
            })
            .await
            .unwrap();

        assert_eq!(delivered, k as usize);
        assert_eq!(outcome.rows, k as usize);
        assert!(provider.stats().reads() <= k as usize);
    }
}

/// Scenario: cancellation fires before row k is read
/// Then fewer than k rows come back and no error is reported
#[tokio::test]
async fn test_cancellation_before_row_k() {
    let provider = provider(users(10));
    let token = CancellationToken::new();
    let trigger = token.clone();
    let k = 5;

    let command = Command::text(Arc::clone(&provider), "SELECT * FROM users")
        .with_cancellation(token);
    let ids = command
        .to_list(|record| {
            let id = id_of(record)?;
            if id == k - 1 {
                trigger.cancel();
            }
            Ok(id)
        })
        .await
        .unwrap();

    assert!(ids.len() < k as usize);
    assert_eq!(command.state(), ExecutionState::Cancelled);
    assert_eq!(provider.stats().closes(), 1);
}

#[tokio::test]
async fn test_buffer_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let result = Command::text(provider(users(3)), "SELECT * FROM users")
        .with_cancellation(token)
        .to_buffer(&ColumnSelection::All)
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.end(), WalkEnd::Cancelled);
}

/// Scenario: scalar execution of a single value 42
#[tokio::test]
async fn test_scalar_42() {
    let result = MemoryResult::new(["answer"]).with_row(vec![Value::Int(42)]);

    let as_int: i32 = Command::text(provider(result.clone()), "SELECT 42")
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(as_int, 42);

    let as_text: String = Command::text(provider(result.clone()), "SELECT 42")
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(as_text, "42");

    let err = Command::text(provider(result), "SELECT 42")
        .execute_scalar::<bool>()
        .await
        .unwrap_err();
    assert!(matches!(err, RowpipeError::TypeMismatch(_)));
}

#[tokio::test]
async fn test_cursor_closed_on_every_path() {
    // Success
    let p = provider(users(3));
    Command::text(Arc::clone(&p), "q").iterate(|_| Ok(())).await.unwrap();
    assert_eq!(p.stats().closes(), p.stats().opened());

    // Early stop
    let p = provider(users(3));
    Command::text(Arc::clone(&p), "q")
        .iterate_while(|_| Ok(false))
        .await
        .unwrap();
    assert_eq!(p.stats().closes(), 1);

    // Cursor fault
    let p = provider(users(3).fail_on_read(2));
    let _ = Command::text(Arc::clone(&p), "q").to_list(id_of).await;
    assert_eq!(p.stats().closes(), 1);

    // Handler failure
    let p = provider(users(3));
    let _ = Command::text(Arc::clone(&p), "q")
        .execute(|_| Box::pin(async { Err::<(), _>(RowpipeError::cursor("handler gave up")) }))
        .await;
    assert_eq!(p.stats().closes(), 1);

    // Cancellation
    let p = provider(users(3));
    let token = CancellationToken::new();
    token.cancel();
    Command::text(Arc::clone(&p), "q")
        .with_cancellation(token)
        .to_records::<Named>()
        .await
        .unwrap();
    assert_eq!(p.stats().closes(), 1);
}

#[derive(Debug, Default)]
struct Named {
    name: String,
}

db_rowpipe::projectable!(Named { name });

#[tokio::test]
async fn test_terminal_command_cannot_be_reused() {
    let command = Command::text(provider(users(2)), "SELECT * FROM users");
    assert_eq!(command.state(), ExecutionState::Unexecuted);

    command.to_buffer(&ColumnSelection::All).await.unwrap();
    assert_eq!(command.state(), ExecutionState::Completed);

    for err in [
        command.to_buffer(&ColumnSelection::All).await.err(),
        command.execute_scalar::<i64>().await.err(),
        command.execute_non_query().await.err(),
        command.to_stream(id_of).err(),
    ] {
        assert!(matches!(err, Some(RowpipeError::InvalidState(_))));
    }
    assert_eq!(command.state(), ExecutionState::Completed);
}

#[tokio::test]
async fn test_parameters_reach_provider() {
    let command = Command::stored_procedure(provider(users(1)), "refresh_user")
        .param("id", 7)
        .param("force", true);

    assert_eq!(command.spec().params.len(), 2);
    assert_eq!(command.spec().params[0].value, Value::Int(7));
    assert_eq!(command.spec().params[1].value, Value::Bool(true));
}

#[tokio::test]
async fn test_results_are_chosen_by_command_text() {
    let provider = Arc::new(MemoryProvider::new(users(1)).with_result_for(
        "SELECT count(*) FROM users",
        MemoryResult::new(["count"]).with_row(vec![Value::Int(99)]),
    ));

    let count: i64 = Command::text(Arc::clone(&provider), "SELECT count(*) FROM users")
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(count, 99);

    let maps = Command::text(provider, "SELECT * FROM users")
        .to_dictionaries(Vec::<String>::new())
        .await
        .unwrap();
    assert_eq!(maps[0].len(), 3);
}
