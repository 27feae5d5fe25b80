//! End-to-end scenarios over the scripted transport.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::testing::{MockFactory, Script};
use crate::types::{Format, Oid};
use crate::{
    Client, ClientError, CustomTypes, FieldDescriptor, FromValue, QueryResponse, Response,
    SessionState, ToValue,
};

fn client(factory: &MockFactory) -> Client {
    Client::with_factory(Arc::new(factory.clone()), CustomTypes::new())
}

// ============================================================================
// Prepared statements
// ============================================================================

#[tokio::test]
async fn test_prepare_and_fire_returns_row() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1::int AS n").await.unwrap();
    let response = stmt.fire(&[&42i32]).await.unwrap();

    match response {
        QueryResponse::ResultSet(rs) => {
            assert_eq!(rs.len(), 1);
            assert_eq!(rs.rows()[0].get::<i32>("n").unwrap(), 42);
        }
        other => panic!("expected a result set, got {:?}", other),
    }
    assert_eq!(stmt.state(), SessionState::Executed);
}

#[tokio::test]
async fn test_parse_once_fire_many() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1::int AS n").await.unwrap();
    for n in 0..5i32 {
        let ns = stmt
            .select(&[&n], |row| row.get::<i32>("n").unwrap())
            .await
            .unwrap();
        assert_eq!(ns, vec![n]);
    }

    assert_eq!(factory.acquired(), 1);
    assert_eq!(factory.count("Parse"), 1);
    assert_eq!(factory.count("Bind"), 5);
    assert_eq!(factory.count("Describe"), 5);
    assert_eq!(factory.count("Execute"), 5);
    assert!(client.registry().contains(stmt.name()));
    assert_eq!(factory.total_closes(), 0);
}

#[tokio::test]
async fn test_exec_reports_affected_rows() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let stmt = client
        .prepare("INSERT INTO t (id, label) VALUES ($1, $2)")
        .await
        .unwrap();

    assert_eq!(stmt.exec(&[&1i32, &"one"]).await.unwrap(), 1);
    assert_eq!(stmt.exec(&[&2i32, &None::<String>]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_wrong_result_kind_is_protocol_mismatch() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let insert = client.prepare("INSERT INTO t VALUES ($1)").await.unwrap();
    let err = insert
        .select(&[&1i32], |row| row.len())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ProtocolMismatch { .. }));

    let select = client.prepare("SELECT $1 AS v").await.unwrap();
    let err = select.exec(&[&1i32]).await.unwrap_err();
    assert!(matches!(err, ClientError::ProtocolMismatch { .. }));

    // The statements themselves completed and stay usable.
    assert_eq!(insert.exec(&[&2i32]).await.unwrap(), 1);
    assert_eq!(client.registry().len(), 2);
}

#[tokio::test]
async fn test_transport_failure_mid_fire_retires_statement() {
    let factory = MockFactory::new();
    factory.script(Script::fail_on("Describe"));
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1::int AS n").await.unwrap();
    let err = stmt.fire(&[&1i32]).await.unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
    assert!(!client.registry().contains(stmt.name()));
    assert_eq!(factory.connection(0).closes(), 1);
    assert_eq!(stmt.state(), SessionState::Failed);

    let err = stmt.fire(&[&1i32]).await.unwrap_err();
    assert!(matches!(err, ClientError::StaleStatement(_)));
    assert_eq!(factory.count("Parse"), 1);
    assert_eq!(factory.connection(0).closes(), 1);
}

#[tokio::test]
async fn test_server_error_on_execute_retires_statement() {
    let factory = MockFactory::new();
    factory.script(Script::server_error_on("Execute"));
    let client = client(&factory);

    let stmt = client.prepare("DELETE FROM t WHERE id = $1").await.unwrap();
    let err = stmt.exec(&[&1i32]).await.unwrap_err();

    match err {
        ClientError::Server(e) => assert_eq!(e.message, "injected server error"),
        other => panic!("expected a server error, got {:?}", other),
    }
    assert!(client.registry().is_empty());
    assert_eq!(factory.total_closes(), 1);
    assert_eq!(
        factory.connection(0).kinds(),
        vec!["Parse", "Bind", "Describe", "Execute", "Sync", "Query"]
    );
}

#[tokio::test]
async fn test_failed_prepare_leaves_nothing_behind() {
    let factory = MockFactory::new();
    factory.script(Script::server_error_on("Parse"));
    let client = client(&factory);

    let err = client.prepare("SELEC 1").await.unwrap_err();

    assert!(matches!(err, ClientError::Server(_)));
    assert!(client.registry().is_empty());
    assert_eq!(factory.total_closes(), 1);
}

#[tokio::test]
async fn test_release_failures_stay_hidden() {
    let factory = MockFactory::new();
    factory.script(
        Script::fail_on("Bind")
            .and_fail_on("Sync")
            .and_server_error_on("Query")
            .and_fail_close(),
    );
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
    let err = stmt.fire(&[&1i32]).await.unwrap_err();

    // The caller sees the Bind failure, not the cleanup failures.
    match err {
        ClientError::Transport(e) => assert!(e.to_string().contains("Bind")),
        other => panic!("expected the Bind failure, got {:?}", other),
    }
    assert_eq!(factory.connection(0).closes(), 1);
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn test_statement_close_is_idempotent() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
    stmt.close().await.unwrap();
    stmt.close().await.unwrap();

    assert!(client.registry().is_empty());
    assert_eq!(factory.count("Close"), 1);
    assert_eq!(factory.total_closes(), 1);

    let err = stmt.fire(&[&1i32]).await.unwrap_err();
    assert!(matches!(err, ClientError::StaleStatement(_)));
}

#[tokio::test]
async fn test_close_after_failure_is_a_no_op() {
    let factory = MockFactory::new();
    factory.script(Script::fail_on("Execute"));
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
    assert!(stmt.fire(&[&1i32]).await.is_err());

    stmt.close().await.unwrap();
    client.close().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(factory.count("Close"), 0);
    assert_eq!(factory.total_closes(), 1);
    assert_eq!(factory.factory_closes(), 1);
}

#[tokio::test]
async fn test_dropped_statement_releases_connection() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
    drop(stmt);

    factory.wait_for_closes(1).await;
    assert!(client.registry().is_empty());
    assert_eq!(factory.connection(0).kinds(), vec!["Parse", "Sync", "Query"]);
}

#[tokio::test]
async fn test_cancelled_fire_still_cleans_up() {
    let factory = MockFactory::new();
    let client = client(&factory);
    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();

    // The mock yields inside every send, so the ready branch wins and the
    // in-flight fire is dropped mid-Bind.
    tokio::select! {
        biased;
        _ = stmt.fire(&[&1i32]) => panic!("fire should not finish first"),
        _ = std::future::ready(()) => {}
    }

    factory.wait_for_closes(1).await;
    assert!(!client.registry().contains(stmt.name()));
    assert!(matches!(
        stmt.fire(&[&1i32]).await,
        Err(ClientError::StaleStatement(_))
    ));
}

#[tokio::test]
async fn test_concurrent_statements_use_their_own_connections() {
    let factory = MockFactory::new();
    let client = Arc::new(client(&factory));

    let tasks: Vec<_> = (0..8i64)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
                let v = stmt
                    .select(&[&i], |row| row.get::<i64>("v").unwrap())
                    .await
                    .unwrap();
                stmt.close().await.unwrap();
                v
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), vec![i as i64]);
    }
    assert_eq!(factory.acquired(), 8);
    assert_eq!(factory.total_closes(), 8);
    assert!(client.registry().is_empty());
    for i in 0..8 {
        assert_eq!(factory.connection(i).count("Parse"), 1);
    }
}

/// Bind a value, echo it back through a prepared SELECT, decode it.
async fn echo<T>(client: &Client, value: T) -> T
where
    T: ToValue + FromValue + Sync,
{
    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();
    let mut values = stmt
        .select(&[&value], |row| row.get::<T>("v").unwrap())
        .await
        .unwrap();
    stmt.close().await.unwrap();
    values.remove(0)
}

#[tokio::test]
async fn test_parameters_echo_unchanged() {
    let factory = MockFactory::new();
    let client = client(&factory);

    assert!(echo(&client, true).await);
    assert_eq!(echo(&client, -7i16).await, -7);
    assert_eq!(echo(&client, i64::MAX).await, i64::MAX);
    assert_eq!(echo(&client, 2.5f32).await, 2.5);
    assert_eq!(echo(&client, "héllo".to_string()).await, "héllo");
    assert_eq!(echo(&client, vec![0u8, 255]).await, vec![0, 255]);

    let id = Uuid::from_u128(0xfeed_beef);
    assert_eq!(echo(&client, id).await, id);

    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(echo(&client, day).await, day);
    let at = day.and_hms_micro_opt(12, 30, 0, 1).unwrap().and_utc();
    assert_eq!(echo(&client, at).await, at);
    assert!(echo(&client, Utc::now()).await <= Utc::now());

    let doc = serde_json::json!({"tags": ["a", "b"], "n": 1});
    assert_eq!(echo(&client, doc.clone()).await, doc);

    assert_eq!(echo(&client, None::<i32>).await, None);
}

// ============================================================================
// Simple queries
// ============================================================================

#[tokio::test]
async fn test_execute_update_delete() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let affected = client
        .execute_update("DELETE FROM t WHERE id = 1")
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(factory.total_closes(), 1);
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn test_fetch_on_command_is_protocol_mismatch() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let err = client
        .fetch("INSERT INTO t VALUES (1)")
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ProtocolMismatch { .. }));
    assert_eq!(factory.total_closes(), 1);
}

#[tokio::test]
async fn test_execute_update_on_rows_is_protocol_mismatch() {
    let factory = MockFactory::new();
    let client = client(&factory);

    let err = client.execute_update("SELECT 1").await.unwrap_err();
    assert!(matches!(err, ClientError::ProtocolMismatch { .. }));
}

fn text_column(name: &str, oid: Oid) -> FieldDescriptor {
    FieldDescriptor::new(name, Format::Text, oid)
}

#[tokio::test]
async fn test_select_projects_text_rows() {
    let factory = MockFactory::new();
    factory.respond_to(
        "SELECT id, name FROM users",
        Response::SelectResult {
            fields: vec![text_column("id", Oid::INT4), text_column("name", Oid::TEXT)],
            rows: vec![
                vec![Some(Bytes::from_static(b"1")), Some(Bytes::from_static(b"ada"))],
                vec![Some(Bytes::from_static(b"2")), None],
            ],
        },
    );
    let client = client(&factory);

    let users = client
        .select("SELECT id, name FROM users", |row| {
            (
                row.get::<i32>("id").unwrap(),
                row.try_get::<String>("name").unwrap(),
            )
        })
        .await
        .unwrap();

    assert_eq!(users, vec![(1, Some("ada".to_string())), (2, None)]);
}

#[tokio::test]
async fn test_empty_result_keeps_field_descriptors() {
    let factory = MockFactory::new();
    factory.respond_to(
        "SELECT id FROM users WHERE false",
        Response::SelectResult {
            fields: vec![text_column("id", Oid::INT4)],
            rows: vec![],
        },
    );
    let client = client(&factory);

    let rs = client
        .fetch("SELECT id FROM users WHERE false")
        .await
        .unwrap();

    assert!(rs.is_empty());
    assert_eq!(rs.columns().index_of("id"), Some(0));
}

#[tokio::test]
async fn test_undecodable_row_fails_whole_query() {
    let factory = MockFactory::new();
    factory.respond_to(
        "SELECT n FROM t",
        Response::SelectResult {
            fields: vec![text_column("n", Oid::INT4)],
            rows: vec![
                vec![Some(Bytes::from_static(b"1"))],
                vec![Some(Bytes::from_static(b"one"))],
            ],
        },
    );
    let client = client(&factory);

    let err = client.fetch("SELECT n FROM t").await.unwrap_err();

    assert!(matches!(err, ClientError::Decode(_)));
    assert_eq!(factory.total_closes(), 1);
}

#[tokio::test]
async fn test_registered_custom_type_decodes_as_text() {
    let factory = MockFactory::new();
    factory.respond_to(
        "SELECT mood FROM people",
        Response::SelectResult {
            fields: vec![FieldDescriptor::new("mood", Format::Binary, Oid(70_001))],
            rows: vec![vec![Some(Bytes::from_static(b"happy"))]],
        },
    );
    let client = client(&factory);
    client.register_type("mood", Oid(70_001));

    let moods = client
        .select("SELECT mood FROM people", |row| row.get::<String>("mood").unwrap())
        .await
        .unwrap();

    assert_eq!(moods, vec!["happy".to_string()]);
    assert_eq!(client.custom_types().oid("mood"), Some(Oid(70_001)));
}

#[tokio::test]
async fn test_simple_query_transport_failure_releases() {
    let factory = MockFactory::new();
    factory.script(Script::fail_on("Query"));
    let client = client(&factory);

    let err = client.query("SELECT 1").await.unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(factory.total_closes(), 1);
}

#[tokio::test]
async fn test_acquire_failure_surfaces() {
    let factory = MockFactory::new();
    factory.fail_acquire(true);
    let client = client(&factory);

    assert!(matches!(
        client.query("SELECT 1").await,
        Err(ClientError::Transport(_))
    ));
    assert!(matches!(
        client.prepare("SELECT 1").await,
        Err(ClientError::Transport(_))
    ));
    assert_eq!(factory.total_closes(), 0);
}

#[tokio::test]
async fn test_closed_client_rejects_work_but_keeps_statements() {
    let factory = MockFactory::new();
    let client = client(&factory);
    let stmt = client.prepare("SELECT $1 AS v").await.unwrap();

    client.close().await.unwrap();

    assert!(client.is_closed());
    assert!(matches!(client.query("SELECT 1").await, Err(ClientError::Closed)));
    assert!(matches!(client.prepare("SELECT 1").await, Err(ClientError::Closed)));

    // In-flight statements are not closed implicitly.
    assert!(stmt.fire(&[&1i32]).await.is_ok());
    stmt.close().await.unwrap();
    assert_eq!(factory.total_closes(), 1);
}
