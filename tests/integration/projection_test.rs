//! Typed record projection integration tests.

use db_rowpipe::db::{MemoryProvider, MemoryResult, Value, ValueKind};
use db_rowpipe::error::RowpipeError;
use db_rowpipe::query::{
    ColumnSelection, Command, Mapping, Member, Projectable, Projector, StandardConverter,
    ValueConverter,
};
use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[derive(Debug, Default, PartialEq)]
struct User {
    id: i32,
    name: String,
}

impl Projectable for User {
    fn members() -> Vec<Member<Self>> {
        vec![
            Member::field("Id", |u: &mut Self| &mut u.id),
            Member::field("Name", |u: &mut Self| &mut u.name),
        ]
    }
}

#[derive(Debug, Default, PartialEq)]
struct Order {
    id: i64,
    total: f64,
    note: Option<String>,
    internal_code: String,
}

impl Projectable for Order {
    fn members() -> Vec<Member<Self>> {
        vec![
            Member::field("id", |o: &mut Self| &mut o.id),
            Member::field("total", |o: &mut Self| &mut o.total),
            Member::field("note", |o: &mut Self| &mut o.note),
            Member::field("internal_code", |o: &mut Self| &mut o.internal_code),
        ]
    }

    fn mapping() -> Mapping {
        Mapping::default()
            .exclude("internal_code")
            .alias("order_id", "id")
            .alias("comment", "note")
    }
}

fn users() -> MemoryResult {
    MemoryResult::new(["id", "name"])
        .with_row(vec![Value::Int(1), Value::from("a")])
        .with_row(vec![Value::Int(2), Value::from("b")])
}

/// Scenario: columns {id, name} projected into members Id, Name
#[tokio::test]
async fn test_records_match_members_case_insensitively() {
    let records = Command::text(Arc::new(MemoryProvider::new(users())), "SELECT id, name FROM users")
        .to_records::<User>()
        .await
        .unwrap();

    assert_eq!(
        records,
        vec![
            User { id: 1, name: "a".to_string() },
            User { id: 2, name: "b".to_string() },
        ]
    );
}

#[tokio::test]
async fn test_record_stream_matches_buffered_projection() {
    let streamed: Vec<User> = Command::text(Arc::new(MemoryProvider::new(users())), "q")
        .to_record_stream::<User>()
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let buffer = Command::text(Arc::new(MemoryProvider::new(users())), "q")
        .to_buffer(&ColumnSelection::All)
        .await
        .unwrap();
    let projected = Projector::<User>::new().project(&buffer).unwrap();

    assert_eq!(streamed, projected);
}

#[tokio::test]
async fn test_aliases_exclusions_and_coercion() {
    let result = MemoryResult::new(["ORDER_ID", "total", "comment", "internal_code", "extra"])
        .with_row(vec![
            Value::from("17"),
            Value::Int(250),
            Value::Null,
            Value::from("x-1"),
            Value::Bool(true),
        ]);

    let orders = Command::text(Arc::new(MemoryProvider::new(result)), "q")
        .to_records::<Order>()
        .await
        .unwrap();

    assert_eq!(
        orders,
        vec![Order {
            id: 17,
            total: 250.0,
            note: None,
            internal_code: String::new(),
        }]
    );
}

/// Scenario: a value cannot be coerced to its member type
/// Then the error names the row and column, and no later row is read
#[tokio::test]
async fn test_projection_error_names_row() {
    let result = MemoryResult::new(["id", "name"])
        .with_row(vec![Value::Int(1), Value::from("a")])
        .with_row(vec![Value::from("not a number"), Value::from("b")])
        .with_row(vec![Value::Int(3), Value::from("c")]);
    let provider = Arc::new(MemoryProvider::new(result));

    let err = Command::text(Arc::clone(&provider), "q")
        .to_records::<User>()
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RowpipeError::Projection {
            row: 1,
            column: "id".to_string(),
            member: "Id".to_string(),
            message: "'not a number' is not an integer".to_string(),
        }
    );
    assert_eq!(provider.stats().reads(), 2);
    assert_eq!(provider.stats().closes(), 1);
}

struct NoStrings;

impl ValueConverter for NoStrings {
    fn convert(&self, value: Value, target: ValueKind) -> Result<Value, String> {
        match value {
            Value::String(_) if target != ValueKind::Text => Err("strings are not converted".to_string()),
            other => StandardConverter.convert(other, target),
        }
    }
}

#[tokio::test]
async fn test_custom_converter_is_used() {
    let result = MemoryResult::new(["id", "name"]).with_row(vec![Value::from("5"), Value::from("e")]);

    let err = Command::text(Arc::new(MemoryProvider::new(result)), "q")
        .with_converter(Arc::new(NoStrings))
        .to_records::<User>()
        .await
        .unwrap_err();

    match err {
        RowpipeError::Projection { message, .. } => assert_eq!(message, "strings are not converted"),
        other => panic!("unexpected error: {other:?}"),
    }
}
