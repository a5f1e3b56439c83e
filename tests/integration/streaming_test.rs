//! Producer/consumer streaming integration tests.
//!
//! Verifies that a stream's consumer controls how far the cursor is read,
//! using cursor read counts rather than output counts.

use db_rowpipe::db::{DataRecord, MemoryCursor, MemoryProvider, MemoryResult, Value};
use db_rowpipe::error::{Result, RowpipeError};
use db_rowpipe::query::{expose_as_stream, Backpressure, ColumnSelection, Command, ExecutionState};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn numbers(n: i64) -> MemoryResult {
    MemoryResult::new(["n", "label"])
        .with_rows((1..=n).map(|i| vec![Value::Int(i), Value::String(format!("row {i}"))]))
}

fn number(record: &MemoryCursor) -> Result<i64> {
    match record.value(0)? {
        Value::Int(n) => Ok(n),
        other => Err(RowpipeError::type_mismatch(other.to_string())),
    }
}

/// Waits until the producer has released its cursor.
async fn wait_for_close(provider: &MemoryProvider) {
    for _ in 0..100 {
        if provider.stats().closes() == provider.stats().opened() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scenario: consumer closes its stream after 3 of 10 rows
/// Then the producer stops after reading row 3
#[tokio::test]
async fn test_consumer_close_after_three_of_ten() {
    let provider = Arc::new(MemoryProvider::new(numbers(10)));
    let command = Command::text(Arc::clone(&provider), "SELECT n FROM t");
    let mut stream = command.to_stream(number).unwrap();

    let mut received = Vec::new();
    while let Some(n) = stream.next().await {
        received.push(n.unwrap());
        if received.len() == 3 {
            break;
        }
    }
    stream.close();
    drop(stream);
    wait_for_close(&provider).await;

    assert_eq!(received, vec![1, 2, 3]);
    assert_eq!(provider.stats().reads(), 3);
    assert_eq!(provider.stats().closes(), 1);
    assert_eq!(command.state(), ExecutionState::Completed);
}

#[tokio::test]
async fn test_stream_delivers_in_cursor_order() {
    for backpressure in [
        Backpressure::Demand,
        Backpressure::Bounded(3),
        Backpressure::Unbounded,
    ] {
        let rows: Vec<Vec<Value>> = Command::text(Arc::new(MemoryProvider::new(numbers(20))), "q")
            .with_backpressure(backpressure)
            .to_row_stream(ColumnSelection::names(["label", "n"]))
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0], vec![Value::from("row 1"), Value::Int(1)]);
        assert_eq!(rows[19][1], Value::Int(20));
    }
}

#[tokio::test]
async fn test_stream_construction_does_not_wait_for_rows() {
    let slow = numbers(3).with_read_delay(Duration::from_millis(200));
    let command = Command::text(Arc::new(MemoryProvider::new(slow)), "q");

    let stream = tokio::time::timeout(Duration::from_millis(50), async {
        command.to_stream(number)
    })
    .await
    .expect("stream construction should not block")
    .unwrap();

    let values: Vec<i64> = stream.try_collect().await.unwrap();
    assert_eq!(values, vec![1, 2, 3]);
}

/// Scenario: cancellation while rows are still flowing
/// Then the stream completes without an error item
#[tokio::test]
async fn test_cancelled_stream_completes_cleanly() {
    let provider = Arc::new(MemoryProvider::new(numbers(100)));
    let token = CancellationToken::new();
    let command = Command::text(Arc::clone(&provider), "q").with_cancellation(token.clone());
    let mut stream = command.to_stream(number).unwrap();

    let mut received = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        received += 1;
        if received == 5 {
            token.cancel();
        }
    }

    assert!(received < 100);
    wait_for_close(&provider).await;
    assert_eq!(provider.stats().closes(), 1);
    assert_eq!(command.state(), ExecutionState::Cancelled);
}

/// Scenario: the cursor faults mid-stream
/// Then earlier rows stay delivered and the fault is the final item
#[tokio::test]
async fn test_fault_mid_stream_keeps_earlier_rows() {
    let provider = Arc::new(MemoryProvider::new(numbers(10).fail_on_read(4)));
    let command = Command::text(Arc::clone(&provider), "q");
    let items: Vec<Result<i64>> = command.to_stream(number).unwrap().collect().await;

    assert_eq!(items.len(), 4);
    assert_eq!(items[..3], [Ok(1), Ok(2), Ok(3)]);
    assert!(matches!(items[3], Err(RowpipeError::CursorFault(_))));
    assert_eq!(command.state(), ExecutionState::Failed);
    assert_eq!(provider.stats().closes(), 1);
}

#[tokio::test]
async fn test_unknown_column_is_only_item() {
    let provider = Arc::new(MemoryProvider::new(numbers(5)));
    let items: Vec<Result<Vec<Value>>> = Command::text(Arc::clone(&provider), "q")
        .to_row_stream(ColumnSelection::names(["missing"]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0], Err(RowpipeError::unknown_column("missing")));
    assert_eq!(provider.stats().reads(), 0);
}

#[tokio::test]
async fn test_forward_to_bounded_channel() {
    let provider = Arc::new(MemoryProvider::new(numbers(6)));
    let (tx, mut rx) = mpsc::channel(2);

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(n) = rx.recv().await {
            seen.push(n);
        }
        seen
    });

    let outcome = Command::text(Arc::clone(&provider), "q")
        .forward_to(number, tx)
        .await
        .unwrap();

    assert_eq!(outcome.rows, 6);
    assert_eq!(consumer.await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_expose_owned_cursor() {
    let cursor = MemoryCursor::new(numbers(10));
    let stats = cursor.stats();
    let doubled: Vec<i64> = expose_as_stream(
        cursor,
        |record: &MemoryCursor| Ok(number(record)? * 2),
        Backpressure::Demand,
        None,
    )
    .take(4)
    .map(|item| item.unwrap())
    .collect()
    .await;

    assert_eq!(doubled, vec![2, 4, 6, 8]);
    for _ in 0..100 {
        if stats.closes() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(stats.reads(), 4);
}
