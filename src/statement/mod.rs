//! Prepared statement lifecycle: prepare, execute, transparent re-prepare
//! on metadata invalidation, close.
//!
//! Statement capabilities are composed from small traits rather than an
//! inheritance chain: anything with SQL text is `Executable`; statements
//! that bind parameters add `ParameterBindable`.

mod batch;

pub use batch::{BatchResult, BatchStrategy};

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{debug, instrument, warn};

use crate::error::Error;
use crate::metrics::metrics;
use crate::protocol::binary::{encode_param_block, Value};
use crate::protocol::packet::{Command, Packet};
use crate::protocol::response::{is_err_packet, ColumnDefinition, ErrPacket};
use crate::result::Execution;
use crate::session::{truncate_sql, ExecuteConfig, Session, SessionShared};

/// Cursor type flag on COM_STMT_EXECUTE
const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

/// Capability: carries executable SQL text
pub trait Executable {
    fn statement_sql(&self) -> &str;
}

/// Capability: binds positional parameters
pub trait ParameterBindable {
    fn parameter_count(&self) -> usize;

    fn check_bindings(&self, params: &[Value]) -> Result<(), Error> {
        if params.len() != self.parameter_count() {
            return Err(Error::Config(format!(
                "statement expects {} parameters, {} bound",
                self.parameter_count(),
                params.len()
            )));
        }
        Ok(())
    }
}

/// Metadata snapshot kept by the per-session statement cache
#[derive(Debug, Clone)]
pub(crate) struct CachedStatement {
    pub statement_id: u32,
    pub parameters: Vec<ColumnDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

/// A server-side prepared statement handle.
///
/// Owned by its session: the handle dies with the session, and any use after
/// session close raises the resource-closed error.
pub struct PreparedStatement {
    pub(crate) session: Arc<SessionShared>,
    sql: String,
    statement_id: u32,
    parameters: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
    closed: bool,
    /// Cached handles skip COM_STMT_CLOSE; the cache owns the server handle
    from_cache: bool,
}

impl Executable for PreparedStatement {
    fn statement_sql(&self) -> &str {
        &self.sql
    }
}

impl ParameterBindable for PreparedStatement {
    fn parameter_count(&self) -> usize {
        self.parameters.len()
    }
}

impl PreparedStatement {
    /// COM_STMT_PREPARE round trip
    #[instrument(skip(session, sql), fields(sql_preview = %truncate_sql(sql, 100)))]
    pub(crate) async fn prepare(
        session: Arc<SessionShared>,
        sql: &str,
    ) -> Result<PreparedStatement, Error> {
        let meta = Self::prepare_wire(&session, sql).await?;
        metrics().record_command("prepare");
        Ok(PreparedStatement {
            session,
            sql: sql.to_string(),
            statement_id: meta.statement_id,
            parameters: meta.parameters,
            columns: meta.columns,
            closed: false,
            from_cache: false,
        })
    }

    /// Prepare reusing the per-session cache when the SQL was seen before.
    pub(crate) async fn prepare_cached(
        session: Arc<SessionShared>,
        sql: &str,
    ) -> Result<PreparedStatement, Error> {
        let cached_meta = session.stmt_cache.get(sql).map(|cached| cached.clone());
        if let Some(meta) = cached_meta {
            debug!(statement_id = meta.statement_id, "Statement cache hit");
            return Ok(PreparedStatement {
                session,
                sql: sql.to_string(),
                statement_id: meta.statement_id,
                parameters: meta.parameters,
                columns: meta.columns,
                closed: false,
                from_cache: true,
            });
        }

        let meta = Self::prepare_wire(&session, sql).await?;
        session.stmt_cache.insert(sql.to_string(), meta.clone());
        Ok(PreparedStatement {
            session,
            sql: sql.to_string(),
            statement_id: meta.statement_id,
            parameters: meta.parameters,
            columns: meta.columns,
            closed: false,
            from_cache: true,
        })
    }

    async fn prepare_wire(
        session: &Arc<SessionShared>,
        sql: &str,
    ) -> Result<CachedStatement, Error> {
        let mut inner = session.lock().await?;
        inner.current_timeout = None;

        session.preflight(&inner, 1 + sql.len(), || {
            format!("prepare: {}", truncate_sql(sql, 100))
        })?;
        session
            .send_command(&mut inner, Command::StmtPrepare.packet(sql.as_bytes()))
            .await?;

        let head = session.read_packet(&mut inner).await?;
        if is_err_packet(&head.payload) {
            let err = ErrPacket::parse(&head.payload, inner.capabilities)
                .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
            return Err(session.classify_server_error(err));
        }

        // Prepare-OK: status, statement id, column count, param count
        let payload = &head.payload;
        if payload.len() < 12 || payload[0] != 0x00 {
            return Err(Error::Protocol("invalid prepare response".to_string()));
        }
        let statement_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let num_columns = u16::from_le_bytes([payload[5], payload[6]]) as u64;
        let num_params = u16::from_le_bytes([payload[7], payload[8]]) as u64;

        let parameters = if num_params > 0 {
            session.read_columns(&mut inner, num_params).await?.0
        } else {
            Vec::new()
        };
        let columns = if num_columns > 0 {
            session.read_columns(&mut inner, num_columns).await?.0
        } else {
            Vec::new()
        };

        inner.status = crate::session::SessionStatus::Ready;
        debug!(
            statement_id,
            params = num_params,
            columns = num_columns,
            "Statement prepared"
        );

        Ok(CachedStatement {
            statement_id,
            parameters,
            columns,
        })
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    /// Column metadata snapshot captured at prepare time
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub async fn execute(&mut self, params: &[Value]) -> Result<Execution, Error> {
        self.execute_with(params, ExecuteConfig::default()).await
    }

    /// Execute with binding. A stale handle (the server asks for a
    /// re-prepare after a metadata change) is transparently re-prepared and
    /// retried exactly once; the second failure surfaces verbatim.
    pub async fn execute_with(
        &mut self,
        params: &[Value],
        config: ExecuteConfig,
    ) -> Result<Execution, Error> {
        if self.closed {
            return Err(Error::ResourceClosed("Statement"));
        }
        self.check_bindings(params)?;

        match self.try_execute(params, config).await {
            Err(Error::Server(e)) if e.needs_reprepare() => {
                warn!(
                    statement_id = self.statement_id,
                    "Stale statement handle, re-preparing once"
                );
                metrics().record_reprepare();
                self.reprepare().await?;
                self.try_execute(params, config).await
            }
            other => other,
        }
    }

    async fn try_execute(
        &mut self,
        params: &[Value],
        config: ExecuteConfig,
    ) -> Result<Execution, Error> {
        let mut inner = self.session.lock().await?;
        inner.current_timeout = config.query_timeout;

        let use_cursor = self.session.options.use_cursor_fetch
            && config.fetch_size > 0
            && !self.columns.is_empty();

        let mut body = BytesMut::with_capacity(10 + params.len() * 8);
        body.put_u32_le(self.statement_id);
        body.put_u8(if use_cursor { CURSOR_TYPE_READ_ONLY } else { 0 });
        body.put_u32_le(1); // iteration count
        if !params.is_empty() {
            encode_param_block(&mut body, params);
        }

        let estimated: usize = 10 + params.iter().map(Value::binary_size).sum::<usize>();
        self.session.preflight(&inner, estimated, || {
            format!("execute: {}", truncate_sql(&self.sql, 100))
        })?;

        self.session
            .send_command(&mut inner, Command::StmtExecute.packet(&body))
            .await?;
        metrics().record_command("execute");

        let cursor_statement = use_cursor.then_some(self.statement_id);
        Execution::from_wire(self.session.clone(), inner, config, true, cursor_statement).await
    }

    /// Re-issue the prepare for this handle after the server invalidated it.
    async fn reprepare(&mut self) -> Result<(), Error> {
        let meta = Self::prepare_wire(&self.session, &self.sql).await?;
        self.adopt_metadata(meta);
        Ok(())
    }

    /// Replace the handle's server id and metadata snapshot after a
    /// re-prepare.
    pub(crate) fn adopt_metadata(&mut self, meta: CachedStatement) {
        if self.from_cache {
            self.session.stmt_cache.insert(self.sql.clone(), meta.clone());
        }
        self.statement_id = meta.statement_id;
        self.parameters = meta.parameters;
        self.columns = meta.columns;
    }

    /// COM_STMT_RESET: discard pending long data / cursor state server-side
    pub async fn reset(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ResourceClosed("Statement"));
        }
        let mut inner = self.session.lock().await?;
        inner.current_timeout = None;
        let mut body = BytesMut::with_capacity(4);
        body.put_u32_le(self.statement_id);
        self.session
            .send_command(&mut inner, Command::StmtReset.packet(&body))
            .await?;
        let packet = self.session.read_packet(&mut inner).await?;
        if is_err_packet(&packet.payload) {
            let err = ErrPacket::parse(&packet.payload, inner.capabilities)
                .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
            return Err(self.session.classify_server_error(err));
        }
        inner.status = crate::session::SessionStatus::Ready;
        Ok(())
    }

    /// COM_STMT_CLOSE (fire and forget; the server sends no reply). Cached
    /// handles stay open server-side for reuse.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.from_cache || self.session.ensure_open().is_err() {
            return Ok(());
        }
        let Ok(mut inner) = self.session.lock().await else {
            return Ok(());
        };
        // COM_STMT_CLOSE gets no reply; send_command still drains any open
        // stream so the wire stays in sync
        self.session
            .send_command(&mut inner, close_packet(self.statement_id))
            .await
            .ok();
        inner.status = crate::session::SessionStatus::Ready;
        Ok(())
    }
}

impl Session {
    /// Prepare through the per-session statement cache
    pub async fn prepare_cached(&self, sql: &str) -> Result<PreparedStatement, Error> {
        PreparedStatement::prepare_cached(self.shared_arc(), sql).await
    }
}

/// COM_STMT_CLOSE packet for a statement handle
pub(crate) fn close_packet(statement_id: u32) -> Packet {
    let mut body = BytesMut::with_capacity(4);
    body.put_u32_le(statement_id);
    Command::StmtClose.packet(&body)
}
