//! Text-protocol execution: multi-result chains, session-state mirroring,
//! charset round trips, cancellation vs timeout.

use std::time::Duration;

use hermes::{Error, ExecuteConfig, MoreResultsMode, Value};

use crate::{get_server_config, setup_table, skip_if_not_enabled};

#[tokio::test]
async fn select_one_roundtrip() {
    skip_if_not_enabled!();
    let session = get_server_config().connect("").await;

    let mut execution = session.execute("SELECT 1").await.unwrap();
    assert_eq!(execution.update_count(), -1);
    let rows = execution.result_set().expect("result set expected");
    let row = rows.next().await.unwrap().expect("one row");
    assert_eq!(row.get_i64(0), Some(1));
    assert!(rows.next().await.unwrap().is_none());
}

#[tokio::test]
async fn multi_statement_chain_yields_three_results() {
    skip_if_not_enabled!();
    let session = get_server_config()
        .connect("allowMultiQueries=true")
        .await;

    let mut execution = session
        .execute("SELECT 1; SELECT 2; SELECT 3;")
        .await
        .unwrap();

    for expected in 1..=3i64 {
        assert_eq!(execution.update_count(), -1);
        let rows = execution.result_set().expect("result set expected");
        let row = rows.next().await.unwrap().expect("one row");
        assert_eq!(row.get_i64(0), Some(expected));
        assert!(rows.next().await.unwrap().is_none());

        let has_more = execution
            .more_results(MoreResultsMode::CloseCurrent)
            .await
            .unwrap();
        assert_eq!(has_more, expected < 3);
    }
}

#[tokio::test]
async fn multi_statement_requires_option() {
    skip_if_not_enabled!();
    let session = get_server_config().connect("").await;

    let err = session
        .execute("SELECT 1; SELECT 2")
        .await
        .expect_err("multi-statement must be rejected");
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn emoji_roundtrip_through_parameters() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    setup_table(
        &session,
        "it_emoji",
        "(id INT PRIMARY KEY, label VARCHAR(64)) CHARACTER SET utf8mb4",
    )
    .await;

    let emoji = "smile 😀 and 🎉";
    let mut statement = session
        .prepare("INSERT INTO it_emoji (id, label) VALUES (?, ?)")
        .await
        .unwrap();
    statement
        .execute(&[Value::Int(1), Value::from_str(emoji)])
        .await
        .unwrap();

    let mut read_back = session
        .prepare("SELECT label FROM it_emoji WHERE id = ?")
        .await
        .unwrap();
    let mut execution = read_back.execute(&[Value::Int(1)]).await.unwrap();
    let rows = execution.result_set().unwrap();
    let row = rows.next().await.unwrap().expect("one row");
    assert_eq!(row.get_string(0).as_deref(), Some(emoji));
}

#[tokio::test]
async fn use_statement_updates_catalog_mirror() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;

    session
        .execute("USE information_schema")
        .await
        .expect("USE should succeed");

    let state = session.state().await;
    assert_eq!(state.catalog.as_deref(), Some("information_schema"));
}

#[tokio::test]
async fn autocommit_change_is_mirrored() {
    skip_if_not_enabled!();
    let session = get_server_config().connect("").await;

    session.execute("SET autocommit = 0").await.unwrap();
    let state = session.state().await;
    assert!(!state.autocommit);

    session.execute("SET autocommit = 1").await.unwrap();
    let state = session.state().await;
    assert!(state.autocommit);
}

#[tokio::test]
async fn cancel_is_distinct_from_timeout() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = std::sync::Arc::new(config.connect("").await);

    // Cancellation path: a second task kills the sleeping query
    let canceller = session.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel().await
    });

    let result = session.execute("SELECT SLEEP(10)").await;
    handle.await.unwrap().expect("cancel should succeed");
    match result {
        Err(Error::Cancelled) => {}
        // Some servers report SLEEP interruption as a normal result of 1
        Ok(_) => eprintln!("server completed SLEEP after kill (interrupted return)"),
        Err(other) => panic!("expected cancellation, got {other}"),
    }

    // Timeout path: the client watchdog fires first
    let session = config.connect("").await;
    let err = session
        .execute_with(
            "SELECT SLEEP(10)",
            ExecuteConfig {
                query_timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await
        .expect_err("watchdog must fire");
    assert!(matches!(err, Error::Timeout(_)));
    // A timed-out session is closed; further use fails locally
    assert!(session.is_closed());
}

#[tokio::test]
async fn closed_session_fails_locally() {
    skip_if_not_enabled!();
    let session = get_server_config().connect("").await;
    session.close().await.unwrap();

    let err = session.execute("SELECT 1").await.expect_err("must fail");
    assert!(matches!(err, Error::ResourceClosed("Connection")));
}

#[tokio::test]
async fn ping_and_reset() {
    skip_if_not_enabled!();
    let session = get_server_config().connect("").await;
    session.ping().await.expect("ping should succeed");
    session.execute("SET @marker = 42").await.unwrap();
    session.reset().await.expect("reset should succeed");

    let mut execution = session.execute("SELECT @marker").await.unwrap();
    let rows = execution.result_set().unwrap();
    let row = rows.next().await.unwrap().unwrap();
    // Reset wiped the user variable
    assert_eq!(row.get_string(0), None);
}
