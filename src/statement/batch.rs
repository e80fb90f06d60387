//! Batch execution strategies.
//!
//! One logical batch (a statement template plus N parameter tuples) can take
//! four wire shapes, each with its own error-reporting granularity:
//!
//! | strategy      | wire shape                         | error granularity        |
//! |---------------|------------------------------------|--------------------------|
//! | Rewrite       | one multi-values INSERT            | whole batch, full SQL    |
//! | MultiQuery    | semicolon-joined statements        | failing statement's SQL  |
//! | PerStatement  | N prepared executions              | template + failing row   |
//! | Bulk          | single bulk-execute command        | template + all rows, cap |
//!
//! The message shapes are contractual and pinned by golden tests.

use bytes::{BufMut, BytesMut};
use tracing::{debug, instrument};

use crate::error::{Error, RowOutcome, ServerError};
use crate::metrics::metrics;
use crate::parser::{analyze_insert, substitute_placeholders, InsertShape};
use crate::protocol::binary::{encode_binary_value, encode_param_type, Value};
use crate::protocol::packet::Command;
use crate::protocol::response::{is_err_packet, ErrPacket};
use crate::session::Session;
use crate::statement::{Executable, ParameterBindable, PreparedStatement};

/// Bulk flag: the command carries a parameter type table
const BULK_SEND_TYPES_TO_SERVER: u16 = 128;

/// Bulk row indicator bytes
const INDICATOR_NONE: u8 = 0x00;
const INDICATOR_NULL: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Multi-values single-statement rewrite
    Rewrite,
    /// Semicolon-separated multi-query
    MultiQuery,
    /// One prepared execution per row
    PerStatement,
    /// MariaDB bulk protocol, one round trip
    Bulk,
}

/// Outcome of a successful batch
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub strategy: BatchStrategy,
    pub total_affected: u64,
    /// Per-row outcomes for strategies with that granularity
    pub outcomes: Option<Vec<RowOutcome>>,
}

/// The decision table of §strategies, driven by the connection options and
/// the statement shape.
pub(crate) fn choose_strategy(
    options: &crate::config::ConnectionOptions,
    shape: Option<&InsertShape>,
    server_supports_bulk: bool,
) -> BatchStrategy {
    if options.rewrite_batched_statements && shape.is_some() {
        return BatchStrategy::Rewrite;
    }
    if options.allow_multi_queries && !options.use_server_prep_stmts {
        return BatchStrategy::MultiQuery;
    }
    if options.use_batch_multi_send && server_supports_bulk {
        return BatchStrategy::Bulk;
    }
    BatchStrategy::PerStatement
}

impl Session {
    /// Execute a parameter batch against a statement template, choosing the
    /// wire strategy from the connection options and the statement shape.
    #[instrument(skip(self, sql, rows), fields(rows = rows.len()))]
    pub async fn execute_batch(
        &self,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> Result<BatchResult, Error> {
        if rows.is_empty() {
            return Ok(BatchResult {
                strategy: BatchStrategy::PerStatement,
                total_affected: 0,
                outcomes: Some(Vec::new()),
            });
        }

        let options = self.shared_options().clone();
        let shape = if options.rewrite_batched_statements {
            analyze_insert(sql)
        } else {
            None
        };
        let strategy = choose_strategy(&options, shape.as_ref(), self.is_mariadb());
        debug!(strategy = ?strategy, "Batch strategy selected");
        metrics().record_batch(rows.len());

        match strategy {
            BatchStrategy::Rewrite => {
                let shape = shape.expect("rewrite strategy implies insert shape");
                self.execute_rewrite_batch(&shape, rows, options.batch_error_message_cap)
                    .await
            }
            BatchStrategy::MultiQuery => {
                self.execute_multi_query_batch(sql, rows, options.batch_error_message_cap)
                    .await
            }
            BatchStrategy::PerStatement | BatchStrategy::Bulk => {
                let mut statement = self.prepare(sql).await?;
                let result = if strategy == BatchStrategy::Bulk {
                    statement
                        .execute_bulk(rows, options.batch_error_message_cap)
                        .await
                } else {
                    statement
                        .execute_per_row(rows, options.batch_error_message_cap)
                        .await
                };
                statement.close().await.ok();
                result
            }
        }
    }

    /// Assemble one multi-values INSERT and run it. The whole batch fails
    /// together; the error carries the fully assembled SQL.
    async fn execute_rewrite_batch(
        &self,
        shape: &InsertShape,
        rows: &[Vec<Value>],
        cap: usize,
    ) -> Result<BatchResult, Error> {
        let max_packet = self.shared_options().max_allowed_packet;
        let mut sql =
            String::with_capacity(shape.prefix.len() + rows.len() * shape.values_group.len());
        sql.push_str(&shape.prefix);

        for (idx, row) in rows.iter().enumerate() {
            if row.len() != shape.placeholders {
                return Err(Error::Config(format!(
                    "batch row {idx} binds {} parameters, statement expects {}",
                    row.len(),
                    shape.placeholders
                )));
            }
            let literals: Vec<String> = row.iter().map(Value::as_sql_literal).collect();
            let group = substitute_placeholders(&shape.values_group, &literals)
                .ok_or_else(|| Error::Config("placeholder mismatch in rewrite".to_string()))?;
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&group);
            // Pre-flight per row so the offending row is named, not just
            // the statement
            if sql.len() + shape.suffix.len() + 1 > max_packet {
                return Err(Error::PacketTooLarge {
                    size: sql.len() + shape.suffix.len() + 1,
                    max: max_packet,
                    context: format!("batch row {idx}"),
                });
            }
        }
        sql.push_str(&shape.suffix);

        match self.execute(&sql).await {
            Ok(execution) => Ok(BatchResult {
                strategy: BatchStrategy::Rewrite,
                total_affected: execution.update_count().max(0) as u64,
                outcomes: None,
            }),
            Err(Error::Server(source)) => Err(Error::Batch {
                message: rewrite_error_message(&source, &sql, cap),
                source,
                outcomes: None,
            }),
            Err(other) => Err(other),
        }
    }

    /// Substitute per row, join with semicolons, walk the result chain.
    /// Each statement reports its own error with only its own SQL.
    async fn execute_multi_query_batch(
        &self,
        template: &str,
        rows: &[Vec<Value>],
        cap: usize,
    ) -> Result<BatchResult, Error> {
        let mut statements = Vec::with_capacity(rows.len());
        for row in rows {
            let literals: Vec<String> = row.iter().map(Value::as_sql_literal).collect();
            let statement = substitute_placeholders(template, &literals)
                .ok_or_else(|| Error::Config("placeholder mismatch in batch".to_string()))?;
            statements.push(statement);
        }
        let joined = statements.join("; ");

        let mut outcomes: Vec<RowOutcome> = Vec::with_capacity(rows.len());
        let mut total_affected = 0u64;

        let mut execution = match self.execute(&joined).await {
            Ok(execution) => execution,
            Err(Error::Server(source)) => {
                // The first statement failed before any result came back
                let mut outcomes = vec![RowOutcome::Failed { code: source.code }];
                outcomes.extend(std::iter::repeat(RowOutcome::Skipped).take(rows.len() - 1));
                return Err(Error::Batch {
                    message: single_statement_error_message(&source, &statements[0], cap),
                    source,
                    outcomes: Some(outcomes),
                });
            }
            Err(other) => return Err(other),
        };

        loop {
            let index = outcomes.len();
            let affected = execution.update_count().max(0) as u64;
            total_affected += affected;
            outcomes.push(RowOutcome::Ok {
                affected_rows: affected,
            });
            if index + 1 >= rows.len() {
                break;
            }
            match execution
                .more_results(crate::result::MoreResultsMode::CloseCurrent)
                .await
            {
                Ok(true) => continue,
                Ok(false) => break,
                Err(Error::Server(source)) => {
                    let failing = outcomes.len().min(statements.len() - 1);
                    outcomes.push(RowOutcome::Failed { code: source.code });
                    outcomes
                        .extend(std::iter::repeat(RowOutcome::Skipped).take(rows.len() - outcomes.len()));
                    return Err(Error::Batch {
                        message: single_statement_error_message(
                            &source,
                            &statements[failing],
                            cap,
                        ),
                        source,
                        outcomes: Some(outcomes),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Ok(BatchResult {
            strategy: BatchStrategy::MultiQuery,
            total_affected,
            outcomes: Some(outcomes),
        })
    }
}

impl PreparedStatement {
    /// Classic path: one prepared execution per row. Stops at the first
    /// failure; the error names the template and the offending row's
    /// parameters, and the remaining rows are marked skipped.
    pub(crate) async fn execute_per_row(
        &mut self,
        rows: &[Vec<Value>],
        cap: usize,
    ) -> Result<BatchResult, Error> {
        let mut outcomes = Vec::with_capacity(rows.len());
        let mut total_affected = 0u64;

        for (idx, row) in rows.iter().enumerate() {
            match self.execute(row).await {
                Ok(execution) => {
                    let affected = execution.update_count().max(0) as u64;
                    total_affected += affected;
                    outcomes.push(RowOutcome::Ok {
                        affected_rows: affected,
                    });
                }
                Err(Error::Server(source)) => {
                    outcomes.push(RowOutcome::Failed { code: source.code });
                    outcomes
                        .extend(std::iter::repeat(RowOutcome::Skipped).take(rows.len() - idx - 1));
                    let message =
                        row_error_message(&source, self.statement_sql(), &rows[idx..=idx], cap);
                    return Err(Error::Batch {
                        message,
                        source,
                        outcomes: Some(outcomes),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Ok(BatchResult {
            strategy: BatchStrategy::PerStatement,
            total_affected,
            outcomes: Some(outcomes),
        })
    }

    /// Bulk protocol: all parameter sets in one COM_STMT_BULK_EXECUTE. The
    /// server reports one verdict for the whole command; the error message
    /// renders every bound tuple up to the cap.
    pub(crate) async fn execute_bulk(
        &mut self,
        rows: &[Vec<Value>],
        cap: usize,
    ) -> Result<BatchResult, Error> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != self.parameter_count() {
                return Err(Error::Config(format!(
                    "batch row {idx} binds {} parameters, statement expects {}",
                    row.len(),
                    self.parameter_count()
                )));
            }
        }

        let mut result = self.try_execute_bulk(rows).await;
        if let Err(Error::Server(e)) = &result {
            if e.needs_reprepare() {
                metrics().record_reprepare();
                self.reprepare_for_batch().await?;
                result = self.try_execute_bulk(rows).await;
            }
        }
        self.finish_bulk(rows, cap, result)
    }

    fn finish_bulk(
        &self,
        rows: &[Vec<Value>],
        cap: usize,
        result: Result<u64, Error>,
    ) -> Result<BatchResult, Error> {
        match result {
            Ok(total_affected) => Ok(BatchResult {
                strategy: BatchStrategy::Bulk,
                total_affected,
                outcomes: None,
            }),
            Err(Error::Server(source)) => Err(Error::Batch {
                message: row_error_message(&source, self.statement_sql(), rows, cap),
                source,
                outcomes: None,
            }),
            Err(other) => Err(other),
        }
    }

    async fn try_execute_bulk(&mut self, rows: &[Vec<Value>]) -> Result<u64, Error> {
        let mut inner = self.session.lock().await?;
        inner.current_timeout = None;

        // Rows that do not fit one command are sent as several bulk
        // commands split at row boundaries; a single oversized row is a
        // pre-flight error naming that row.
        let max_packet = inner.max_allowed_packet;
        let mut total_affected = 0u64;
        let mut pending = rows;
        let mut absolute_index = 0usize;

        while !pending.is_empty() {
            let mut body = BytesMut::with_capacity(7 + pending.len() * 16);
            body.put_u32_le(self.statement_id());
            body.put_u16_le(BULK_SEND_TYPES_TO_SERVER);
            for value in &pending[0] {
                encode_param_type(&mut body, value);
            }

            let mut taken = 0;
            for (offset, row) in pending.iter().enumerate() {
                let row_size: usize =
                    row.iter().map(|v| 1 + v.binary_size()).sum::<usize>();
                if 1 + body.len() + row_size > max_packet {
                    if taken == 0 {
                        return Err(Error::PacketTooLarge {
                            size: 1 + body.len() + row_size,
                            max: max_packet,
                            context: format!("batch row {}", absolute_index + offset),
                        });
                    }
                    break;
                }
                for value in row {
                    if value.is_null() {
                        body.put_u8(INDICATOR_NULL);
                    } else {
                        body.put_u8(INDICATOR_NONE);
                        encode_binary_value(&mut body, value);
                    }
                }
                taken += 1;
            }

            self.session
                .send_command(&mut inner, Command::StmtBulkExecute.packet(&body))
                .await?;
            metrics().record_command("bulk_execute");

            let packet = self.session.read_packet(&mut inner).await?;
            if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload, inner.capabilities)
                    .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
                return Err(self.session.classify_server_error(err));
            }
            let ok = crate::protocol::response::OkPacket::parse(&packet.payload, inner.capabilities)
                .ok_or_else(|| Error::Protocol("unexpected bulk response".to_string()))?;
            self.session.apply_ok(&mut inner, &ok);
            total_affected += ok.affected_rows;

            pending = &pending[taken..];
            absolute_index += taken;
        }

        Ok(total_affected)
    }

    async fn reprepare_for_batch(&mut self) -> Result<(), Error> {
        // Bulk retries share the single-retry contract of execute_with
        let sql = self.statement_sql().to_string();
        let session = self.session.clone();
        let meta = Self::prepare_wire(&session, &sql).await?;
        self.adopt_metadata(meta);
        Ok(())
    }
}

/// Rewrite mode: server message plus the fully assembled statement.
fn rewrite_error_message(source: &ServerError, sql: &str, cap: usize) -> String {
    format!("{}\nQuery is: {}", source.message, elide(sql, cap))
}

/// MultiQuery mode: only the failing statement's SQL.
fn single_statement_error_message(source: &ServerError, sql: &str, cap: usize) -> String {
    format!("{}\nQuery is: {}", source.message, elide(sql, cap))
}

/// PerStatement / Bulk: template plus rendered parameter tuples.
fn row_error_message(
    source: &ServerError,
    template: &str,
    rows: &[Vec<Value>],
    cap: usize,
) -> String {
    let mut rendered = String::new();
    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            rendered.push_str(", ");
        }
        rendered.push('(');
        for (pidx, value) in row.iter().enumerate() {
            if pidx > 0 {
                rendered.push_str(", ");
            }
            rendered.push_str(&value.as_sql_literal());
        }
        rendered.push(')');
        if rendered.len() > cap {
            break;
        }
    }
    format!(
        "{}\nQuery is: {}, parameters {}",
        source.message,
        template,
        elide(&rendered, cap)
    )
}

/// Cut the rendering at the character budget and append `...`. The cut may
/// land mid-token; that is the documented shape.
fn elide(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;

    fn server_error() -> ServerError {
        ServerError {
            code: 1406,
            sql_state: "22001".to_string(),
            message: "Data too long for column 'name' at row 57".to_string(),
        }
    }

    fn whoua_rows(n: usize) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| vec![Value::from_str(&format!("whoua{i}")), Value::Int(i as i64)])
            .collect()
    }

    #[test]
    fn strategy_decision_table() {
        let mut options = ConnectionOptions::default();
        let shape = analyze_insert("INSERT INTO t (a, b) VALUES (?, ?)");

        // Default: bulk on MariaDB, per-statement elsewhere
        assert_eq!(
            choose_strategy(&options, shape.as_ref(), true),
            BatchStrategy::Bulk
        );
        assert_eq!(
            choose_strategy(&options, shape.as_ref(), false),
            BatchStrategy::PerStatement
        );

        // Rewrite wins when enabled and the statement is a simple INSERT
        options.rewrite_batched_statements = true;
        assert_eq!(
            choose_strategy(&options, shape.as_ref(), true),
            BatchStrategy::Rewrite
        );
        assert_eq!(
            choose_strategy(&options, None, true),
            BatchStrategy::Bulk
        );

        // Multi-query requires multi-statements and no server prepare
        options.rewrite_batched_statements = false;
        options.allow_multi_queries = true;
        options.use_server_prep_stmts = false;
        assert_eq!(
            choose_strategy(&options, shape.as_ref(), true),
            BatchStrategy::MultiQuery
        );

        // Bulk disabled falls back to classic
        options.allow_multi_queries = false;
        options.use_server_prep_stmts = true;
        options.use_batch_multi_send = false;
        assert_eq!(
            choose_strategy(&options, shape.as_ref(), true),
            BatchStrategy::PerStatement
        );
    }

    #[test]
    fn rewrite_message_contains_full_sql_when_under_cap() {
        let sql = "INSERT INTO t (a, b) VALUES ('x', 1), ('y', 2)";
        let message = rewrite_error_message(&server_error(), sql, 1024);
        assert!(message.contains("Data too long"));
        assert!(message.ends_with(sql));
        assert!(!message.contains("..."));
    }

    #[test]
    fn rewrite_message_is_elided_over_cap() {
        let sql = format!(
            "INSERT INTO t (a, b) VALUES {}",
            (0..200)
                .map(|i| format!("('whoua{i}', {i})"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let message = rewrite_error_message(&server_error(), &sql, 1024);
        assert!(message.ends_with("..."));
        // The rendered SQL portion stays within cap + ellipsis
        let query_part = message.split("Query is: ").nth(1).unwrap();
        assert_eq!(query_part.len(), 1024 + 3);
    }

    #[test]
    fn bulk_message_renders_all_tuples_up_to_cap() {
        let rows = whoua_rows(200);
        let message = row_error_message(
            &server_error(),
            "INSERT INTO t (a, b) VALUES (?, ?)",
            &rows,
            1024,
        );
        assert!(message.contains("parameters ('whoua0', 0), ('whoua1', 1)"));
        // The cut lands mid-token with the trailing ellipsis
        assert!(message.ends_with("..."));
        assert!(message.contains("('whoua56', 56), ('whoua57', 57)"));
    }

    #[test]
    fn bulk_message_is_untruncated_under_cap() {
        let rows = whoua_rows(2);
        let message = row_error_message(
            &server_error(),
            "INSERT INTO t (a, b) VALUES (?, ?)",
            &rows,
            1024,
        );
        assert!(message.ends_with("parameters ('whoua0', 0), ('whoua1', 1)"));
    }

    #[test]
    fn per_row_message_names_only_the_offending_row() {
        let rows = whoua_rows(10);
        let message = row_error_message(
            &server_error(),
            "INSERT INTO t (a, b) VALUES (?, ?)",
            &rows[3..=3],
            1024,
        );
        assert!(message.ends_with("parameters ('whoua3', 3)"));
        assert!(!message.contains("whoua4"));
    }

    #[test]
    fn elide_is_exact_at_boundary() {
        assert_eq!(elide("abc", 3), "abc");
        assert_eq!(elide("abcd", 3), "abc...");
    }
}
