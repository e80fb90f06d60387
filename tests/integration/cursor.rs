//! Fetch-size-driven streaming, server cursors, result staleness and
//! KEEP_CURRENT_RESULT semantics.

use hermes::{Error, ExecuteConfig, MoreResultsMode, Value};

use crate::{get_server_config, setup_table, skip_if_not_enabled};

async fn seed_rows(session: &hermes::Session, table: &str, count: i64) {
    setup_table(session, table, "(id INT PRIMARY KEY, v VARCHAR(32))").await;
    let rows: Vec<Vec<Value>> = (0..count)
        .map(|i| vec![Value::Int(i), Value::from_str(&format!("row{i}"))])
        .collect();
    session
        .execute_batch(&format!("INSERT INTO {table} (id, v) VALUES (?, ?)"), &rows)
        .await
        .expect("seed batch should succeed");
}

#[tokio::test]
async fn buffered_and_streaming_agree_on_rows() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    seed_rows(&session, "it_stream", 100).await;

    let mut buffered = session
        .execute("SELECT id FROM it_stream ORDER BY id")
        .await
        .unwrap();
    let mut buffered_ids = Vec::new();
    let rows = buffered.result_set().unwrap();
    while let Some(row) = rows.next().await.unwrap() {
        buffered_ids.push(row.get_i64(0).unwrap());
    }

    let mut streaming = session
        .execute_with(
            "SELECT id FROM it_stream ORDER BY id",
            ExecuteConfig {
                fetch_size: 7,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut streaming_ids = Vec::new();
    let rows = streaming.result_set().unwrap();
    while let Some(row) = rows.next().await.unwrap() {
        streaming_ids.push(row.get_i64(0).unwrap());
    }

    assert_eq!(buffered_ids, streaming_ids);
    assert_eq!(buffered_ids.len(), 100);
}

#[tokio::test]
async fn new_command_closes_undrained_stream() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    seed_rows(&session, "it_stale", 50).await;

    let mut streaming = session
        .execute_with(
            "SELECT id FROM it_stale ORDER BY id",
            ExecuteConfig {
                fetch_size: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut cursor = streaming.take_result_set().unwrap();
    let first = cursor.next().await.unwrap().expect("first row");
    assert_eq!(first.get_i64(0), Some(0));

    // Any new command implicitly closes the open stream
    session.execute("SELECT 1").await.unwrap();

    let err = cursor.next().await.expect_err("stream must be closed");
    assert!(matches!(err, Error::ResourceClosed("ResultSet")));
    // The session itself stays usable
    session.ping().await.unwrap();
}

#[tokio::test]
async fn keep_current_result_stays_positionable() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("allowMultiQueries=true").await;

    let mut execution = session
        .execute_with(
            "SELECT 1; SELECT 2",
            ExecuteConfig {
                fetch_size: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Read the first result partially, then advance keeping it
    let rows = execution.result_set().unwrap();
    let row = rows.next().await.unwrap().expect("first result row");
    assert_eq!(row.get_i64(0), Some(1));

    let has_more = execution
        .more_results(MoreResultsMode::KeepCurrent)
        .await
        .unwrap();
    assert!(has_more);

    // The kept result is drained into its buffer and rewindable
    let mut kept = execution.take_previous().expect("kept result");
    kept.rewind();
    let row = kept.next().await.unwrap().expect("kept row re-read");
    assert_eq!(row.get_i64(0), Some(1));

    // The second result is exposed
    let rows = execution.result_set().expect("second result");
    let row = rows.next().await.unwrap().expect("second result row");
    assert_eq!(row.get_i64(0), Some(2));
}

#[tokio::test]
async fn server_cursor_fetch_drains_all_rows() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("useCursorFetch=true").await;
    seed_rows(&session, "it_cursor", 37).await;

    let mut statement = session
        .prepare("SELECT id FROM it_cursor ORDER BY id")
        .await
        .unwrap();
    let mut execution = statement
        .execute_with(
            &[],
            ExecuteConfig {
                fetch_size: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let rows = execution.result_set().expect("cursor result");
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await.unwrap() {
        seen.push(row.get_i64(0).unwrap());
    }
    assert_eq!(seen, (0..37).collect::<Vec<_>>());
    statement.close().await.unwrap();
}

#[tokio::test]
async fn max_rows_caps_delivery_without_loss() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    seed_rows(&session, "it_maxrows", 30).await;

    // max_rows with buffered fetch
    let mut execution = session
        .execute_with(
            "SELECT id FROM it_maxrows ORDER BY id",
            ExecuteConfig {
                max_rows: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let rows = execution.result_set().unwrap();
    let mut n = 0;
    while let Some(_row) = rows.next().await.unwrap() {
        n += 1;
    }
    assert_eq!(n, 10);

    // LIMIT and fetch_size=0 agree with an uncapped read
    let mut execution = session
        .execute("SELECT id FROM it_maxrows ORDER BY id LIMIT 10")
        .await
        .unwrap();
    let rows = execution.result_set().unwrap();
    let mut limit_ids = Vec::new();
    while let Some(row) = rows.next().await.unwrap() {
        limit_ids.push(row.get_i64(0).unwrap());
    }
    assert_eq!(limit_ids, (0..10).collect::<Vec<_>>());
}
