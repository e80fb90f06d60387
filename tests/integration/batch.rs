//! Batch strategies against a live server: wire shapes, error-message
//! contracts, re-prepare after schema change.

use hermes::{BatchStrategy, Error, Value};

use crate::{get_server_config, setup_table, skip_if_not_enabled};

fn rows(n: usize) -> Vec<Vec<Value>> {
    (0..n)
        .map(|i| vec![Value::from_str(&format!("whoua{i}")), Value::Int(i as i64)])
        .collect()
}

const INSERT: &str = "INSERT INTO it_batch (name, n) VALUES (?, ?)";

async fn batch_table(session: &hermes::Session) {
    setup_table(session, "it_batch", "(name VARCHAR(10), n INT)").await;
}

#[tokio::test]
async fn default_batch_inserts_all_rows() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    batch_table(&session).await;

    let result = session.execute_batch(INSERT, &rows(50)).await.unwrap();
    if session.is_mariadb() {
        assert_eq!(result.strategy, BatchStrategy::Bulk);
    } else {
        assert_eq!(result.strategy, BatchStrategy::PerStatement);
    }

    let mut execution = session.execute("SELECT COUNT(*) FROM it_batch").await.unwrap();
    let rows_cursor = execution.result_set().unwrap();
    let row = rows_cursor.next().await.unwrap().unwrap();
    assert_eq!(row.get_i64(0), Some(50));
}

#[tokio::test]
async fn rewrite_strategy_inserts_all_rows() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("rewriteBatchedStatements=true").await;
    batch_table(&session).await;

    let result = session.execute_batch(INSERT, &rows(20)).await.unwrap();
    assert_eq!(result.strategy, BatchStrategy::Rewrite);
    assert_eq!(result.total_affected, 20);
}

#[tokio::test]
async fn rewrite_error_contains_assembled_sql() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config
        .connect("rewriteBatchedStatements=true&jdbcCompliantTruncation=true")
        .await;
    batch_table(&session).await;

    // Row 3 overflows VARCHAR(10)
    let mut bad = rows(5);
    bad[3][0] = Value::from_str("this-name-is-way-too-long-for-the-column");

    let err = session
        .execute_batch(INSERT, &bad)
        .await
        .expect_err("length violation must fail");
    match err {
        Error::Batch {
            message, outcomes, ..
        } => {
            // The fully assembled multi-values INSERT is embedded
            assert!(message.contains("INSERT INTO it_batch (name, n) VALUES"));
            assert!(message.contains("('whoua0', 0)"));
            assert!(outcomes.is_none());
        }
        other => panic!("expected batch error, got {other}"),
    }
}

#[tokio::test]
async fn bulk_error_renders_parameter_tuples() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    if !session.is_mariadb() {
        eprintln!("bulk protocol needs MariaDB, skipping");
        return;
    }
    batch_table(&session).await;

    let mut bad = rows(100);
    bad[57][0] = Value::from_str("this-name-is-way-too-long-for-the-column");

    let err = session
        .execute_batch(INSERT, &bad)
        .await
        .expect_err("length violation must fail");
    match err {
        Error::Batch { message, .. } => {
            // Template plus every tuple up to the cap, elided with ...
            assert!(message.contains("INSERT INTO it_batch (name, n) VALUES (?, ?)"));
            assert!(message.contains("('whoua0', 0), ('whoua1', 1)"));
            assert!(message.ends_with("..."));
        }
        other => panic!("expected batch error, got {other}"),
    }
}

#[tokio::test]
async fn per_row_error_marks_skipped_rows() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("useBatchMultiSend=false").await;
    batch_table(&session).await;

    let mut bad = rows(10);
    bad[4][0] = Value::from_str("this-name-is-way-too-long-for-the-column");

    let err = session
        .execute_batch(INSERT, &bad)
        .await
        .expect_err("length violation must fail");
    match err {
        Error::Batch {
            message,
            outcomes: Some(outcomes),
            ..
        } => {
            assert!(message.contains("parameters ('this-name-is-way-too-long"));
            assert_eq!(outcomes.len(), 10);
            assert!(matches!(outcomes[3], hermes::RowOutcome::Ok { .. }));
            assert!(matches!(outcomes[4], hermes::RowOutcome::Failed { .. }));
            assert!(matches!(outcomes[9], hermes::RowOutcome::Skipped));
        }
        other => panic!("expected batch error with outcomes, got {other}"),
    }
}

#[tokio::test]
async fn reprepare_after_compatible_alter_is_transparent() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    setup_table(&session, "it_reprep", "(id INT PRIMARY KEY, v SMALLINT)").await;

    let mut statement = session
        .prepare("SELECT id, v FROM it_reprep WHERE id = ?")
        .await
        .unwrap();
    statement.execute(&[Value::Int(1)]).await.unwrap();

    // Widen the column: the old handle is invalidated server-side
    session
        .execute("ALTER TABLE it_reprep MODIFY v BIGINT")
        .await
        .unwrap();

    // Transparent re-prepare on the next execute
    statement
        .execute(&[Value::Int(1)])
        .await
        .expect("re-prepare should be transparent");
    statement.close().await.unwrap();
}

#[tokio::test]
async fn incompatible_rename_fails_exactly_once() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let session = config.connect("").await;
    setup_table(&session, "it_rename", "(id INT PRIMARY KEY, v INT)").await;

    let mut statement = session
        .prepare("SELECT v FROM it_rename WHERE id = ?")
        .await
        .unwrap();
    statement.execute(&[Value::Int(1)]).await.unwrap();

    session
        .execute("ALTER TABLE it_rename CHANGE v w INT")
        .await
        .unwrap();

    // The engine retries once (re-prepare), the second failure surfaces
    // verbatim as the server's column error
    let err = statement
        .execute(&[Value::Int(1)])
        .await
        .expect_err("renamed column must fail");
    match err {
        Error::Server(e) => assert_eq!(e.code, 1054),
        other => panic!("expected server error, got {other}"),
    }
    statement.close().await.unwrap();
}
