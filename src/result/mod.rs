//! Result streaming and cursor engine.
//!
//! Two fetch modes: buffered (the whole result is read into the row buffer
//! at execute time) and streaming/cursor (rows are pulled on demand, bounded
//! by the fetch size). A streaming cursor is implicitly closed when any new
//! command starts on the session; buffered cursors have no network tie and
//! stay readable.

use std::sync::Arc;

use bytes::BufMut;
use bytes::BytesMut;
use tracing::debug;

use crate::error::Error;
use crate::protocol::binary::{decode_binary_row, decode_text_row, Value};
use crate::protocol::packet::{Command, Packet};
use crate::protocol::response::{
    is_err_packet, is_local_infile_packet, parse_column_count, ColumnDefinition, ErrPacket,
    OkPacket,
};
use crate::session::{
    parse_result_end, ExecuteConfig, PendingStream, SessionInner, SessionShared, SessionStatus,
};
use tokio::sync::MutexGuard;

/// What `more_results` does with the result being left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreResultsMode {
    /// Default: the current result becomes unreadable
    CloseCurrent,
    /// Drain the current result into its buffer first; it stays positionable
    KeepCurrent,
}

/// One decoded row with its column metadata
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[ColumnDefinition]>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Column lookup by result-set name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))?;
        self.values.get(idx)
    }

    /// String view of a cell; bytes decode as UTF-8
    pub fn get_string(&self, index: usize) -> Option<String> {
        match self.values.get(index)? {
            Value::Null => None,
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
            other => Some(other.as_sql_literal().trim_matches('\'').to_string()),
        }
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        match self.values.get(index)? {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bytes(b) => String::from_utf8_lossy(b).parse().ok(),
            _ => None,
        }
    }
}

pub(crate) enum FetchMode {
    /// All rows are in the buffer
    Buffered,
    /// Rows still arrive on the session socket
    Streaming,
    /// Rows are pulled with COM_STMT_FETCH against a server cursor
    Cursor { statement_id: u32 },
}

/// A readable result set.
pub struct ResultSetCursor {
    session: Arc<SessionShared>,
    columns: Arc<[ColumnDefinition]>,
    rows: Vec<Row>,
    position: usize,
    mode: FetchMode,
    binary: bool,
    /// Command generation this cursor belongs to; staleness check for
    /// streaming/cursor modes
    generation: u64,
    fetch_size: u32,
    max_rows: u64,
    delivered: u64,
    /// No more rows server-side
    exhausted: bool,
    closed: bool,
    /// Mid-stream failure surfaced on the next user call
    deferred_error: Option<Error>,
}

impl ResultSetCursor {
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next row, or None when the result is exhausted (or the client-side
    /// max-rows cap is reached). Delivered rows stay in the buffer so a
    /// result kept across `more_results` remains positionable.
    pub async fn next(&mut self) -> Result<Option<Row>, Error> {
        if let Some(err) = self.deferred_error.take() {
            self.closed = true;
            return Err(err);
        }
        if self.closed {
            return Err(Error::ResourceClosed("ResultSet"));
        }
        if self.max_rows > 0 && self.delivered >= self.max_rows {
            return Ok(None);
        }

        if self.position >= self.rows.len() {
            if matches!(self.mode, FetchMode::Buffered) || self.exhausted {
                return Ok(None);
            }

            // A newer command on the session implicitly closed this stream
            if self.session.current_generation() != self.generation {
                self.closed = true;
                return Err(Error::ResourceClosed("ResultSet"));
            }

            match self.fetch_from_wire().await {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            }
        }

        let row = self.rows[self.position].clone();
        self.position += 1;
        self.delivered += 1;
        Ok(Some(row))
    }

    /// Reset the read position of a buffered (or drained) result
    pub fn rewind(&mut self) {
        self.position = 0;
        self.delivered = 0;
    }

    /// Number of rows currently buffered
    pub fn buffered_len(&self) -> usize {
        self.rows.len()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Pull more rows into the buffer. Returns false when the server side
    /// is exhausted.
    async fn fetch_from_wire(&mut self) -> Result<bool, Error> {
        match self.mode {
            FetchMode::Streaming => self.fetch_streaming_row().await,
            FetchMode::Cursor { statement_id } => self.fetch_cursor_rows(statement_id).await,
            FetchMode::Buffered => Ok(false),
        }
    }

    async fn fetch_streaming_row(&mut self) -> Result<bool, Error> {
        let mut inner = self.session.lock().await?;
        // Re-check under the lock: a command may have won the race
        if self.session.current_generation() != self.generation {
            self.closed = true;
            return Err(Error::ResourceClosed("ResultSet"));
        }

        match read_row_event(&self.session, &mut inner, &self.columns, self.binary).await {
            Ok(RowEvent::Row(values)) => {
                self.rows.push(Row {
                    columns: self.columns.clone(),
                    values,
                });
                Ok(true)
            }
            Ok(RowEvent::End { more_results, .. }) => {
                self.exhausted = true;
                inner.chain_more_results = more_results;
                if let Some(pending) = inner.pending_stream.as_mut() {
                    pending.done = true;
                }
                inner.status = SessionStatus::Ready;
                Ok(false)
            }
            Err(e) => {
                // The connection may be closed; surface the error now and
                // keep it for any retry of a user-visible call
                if let Some(pending) = inner.pending_stream.as_mut() {
                    pending.done = true;
                }
                Err(e)
            }
        }
    }

    /// Pull the next fetch-size block of rows through the server cursor.
    async fn fetch_cursor_rows(&mut self, statement_id: u32) -> Result<bool, Error> {
        let mut inner = self.session.lock().await?;
        if self.session.current_generation() != self.generation {
            self.closed = true;
            return Err(Error::ResourceClosed("ResultSet"));
        }

        let n = self.fetch_size.max(1);
        let mut body = BytesMut::with_capacity(8);
        body.put_u32_le(statement_id);
        body.put_u32_le(n);
        inner.start_command_frame();
        self.session
            .send_raw(&mut inner, Command::StmtFetch.packet(&body))
            .await?;

        let mut got_rows = false;
        loop {
            match read_row_event(&self.session, &mut inner, &self.columns, true).await? {
                RowEvent::Row(values) => {
                    self.rows.push(Row {
                        columns: self.columns.clone(),
                        values,
                    });
                    got_rows = true;
                }
                RowEvent::End {
                    cursor_exhausted, ..
                } => {
                    // The server flags the last fetch; no extra round trip
                    if cursor_exhausted {
                        self.exhausted = true;
                    }
                    break;
                }
            }
        }

        if !got_rows {
            self.exhausted = true;
        }
        if self.exhausted {
            inner.status = SessionStatus::Ready;
        }
        Ok(got_rows)
    }

    /// Drain every remaining server-side row into the buffer and convert to
    /// buffered mode. After this the cursor has no network tie; rows
    /// already delivered stay in place, so the result remains positionable.
    pub(crate) async fn drain_to_buffer(&mut self) -> Result<(), Error> {
        if matches!(self.mode, FetchMode::Buffered) || self.exhausted {
            self.mode = FetchMode::Buffered;
            return Ok(());
        }
        loop {
            match self.fetch_from_wire().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    self.deferred_error = Some(e);
                    break;
                }
            }
        }
        self.mode = FetchMode::Buffered;
        Ok(())
    }
}

pub(crate) enum RowEvent {
    Row(Vec<Value>),
    End {
        more_results: bool,
        cursor_exhausted: bool,
    },
}

/// Read one row packet (or the result terminator) off the wire.
pub(crate) async fn read_row_event(
    shared: &SessionShared,
    inner: &mut SessionInner,
    columns: &[ColumnDefinition],
    binary: bool,
) -> Result<RowEvent, Error> {
    let packet = shared.read_packet(inner).await?;

    if is_err_packet(&packet.payload) {
        let err = ErrPacket::parse(&packet.payload, inner.capabilities)
            .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
        inner.status = SessionStatus::Ready;
        if let Some(pending) = inner.pending_stream.as_mut() {
            pending.done = true;
        }
        return Err(shared.classify_server_error(err));
    }

    if let Some(end) = parse_result_end(&packet.payload, inner.capabilities) {
        return Ok(RowEvent::End {
            more_results: end.more_results,
            cursor_exhausted: end.cursor_exhausted,
        });
    }

    let values = if binary {
        decode_binary_row(&packet.payload, columns)
    } else {
        decode_text_row(&packet.payload, columns)
    }
    .ok_or_else(|| Error::Protocol("malformed row packet".to_string()))?;

    Ok(RowEvent::Row(values))
}

enum CurrentResult {
    UpdateCount { affected: u64, last_insert_id: u64 },
    Rows(ResultSetCursor),
    Done,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

/// Handle over one execution's result chain
pub struct Execution {
    session: Arc<SessionShared>,
    config: ExecuteConfig,
    binary: bool,
    current: CurrentResult,
    /// Previous result retained by `MoreResultsMode::KeepCurrent`
    previous: Option<ResultSetCursor>,
}

impl Execution {
    /// Read the head of a result off the wire. Called with the session lock
    /// still held from the command send. `cursor_statement` is set when the
    /// execute asked the server to open a cursor for that statement id.
    pub(crate) async fn from_wire(
        session: Arc<SessionShared>,
        mut inner: MutexGuard<'_, SessionInner>,
        config: ExecuteConfig,
        binary: bool,
        cursor_statement: Option<u32>,
    ) -> Result<Execution, Error> {
        let current =
            read_result_head(&session, &mut inner, &config, binary, cursor_statement, 0).await?;
        drop(inner);
        Ok(Execution {
            session,
            config,
            binary,
            current,
            previous: None,
        })
    }

    /// Update count of the current result; -1 when the current result is a
    /// result set (or the chain is exhausted).
    pub fn update_count(&self) -> i64 {
        match &self.current {
            CurrentResult::UpdateCount { affected, .. } => *affected as i64,
            _ => -1,
        }
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        match &self.current {
            CurrentResult::UpdateCount { last_insert_id, .. } => Some(*last_insert_id),
            _ => None,
        }
    }

    /// Current result set, if the current result produced rows
    pub fn result_set(&mut self) -> Option<&mut ResultSetCursor> {
        match &mut self.current {
            CurrentResult::Rows(cursor) => Some(cursor),
            _ => None,
        }
    }

    /// Detach the current result set. Safe for buffered cursors; a detached
    /// streaming cursor is closed by the next command like any other.
    pub fn take_result_set(&mut self) -> Option<ResultSetCursor> {
        match std::mem::replace(&mut self.current, CurrentResult::Done) {
            CurrentResult::Rows(cursor) => Some(cursor),
            other => {
                self.current = other;
                None
            }
        }
    }

    /// Result retained by the last `more_results(KeepCurrent)` call
    pub fn take_previous(&mut self) -> Option<ResultSetCursor> {
        self.previous.take()
    }

    /// Advance to the next result in the chain. Returns false when the
    /// chain is exhausted.
    pub async fn more_results(&mut self, mode: MoreResultsMode) -> Result<bool, Error> {
        // Settle the current result first
        match std::mem::replace(&mut self.current, CurrentResult::Done) {
            CurrentResult::Rows(mut cursor) => match mode {
                MoreResultsMode::KeepCurrent => {
                    cursor.drain_to_buffer().await?;
                    self.previous = Some(cursor);
                }
                MoreResultsMode::CloseCurrent => {
                    cursor.close();
                    self.previous = None;
                }
            },
            _ => {
                self.previous = None;
            }
        }

        // Invalidate any detached streaming cursor from the result we just
        // left; the wire now belongs to the next result in the chain.
        self.session.bump_generation();

        let mut inner = self.session.lock().await?;
        // The closed (or detached) result may still have rows on the wire
        self.session.drain_current_result(&mut inner).await?;
        if !inner.chain_more_results {
            return Ok(false);
        }
        inner.chain_more_results = false;
        let current = read_result_head(
            &self.session,
            &mut inner,
            &self.config,
            self.binary,
            None,
            0,
        )
        .await?;
        drop(inner);
        self.current = current;
        Ok(true)
    }
}

/// Dispatch the first packet of a result: OK, ERR, LOCAL INFILE request or
/// a result-set header.
async fn read_result_head(
    session: &Arc<SessionShared>,
    inner: &mut SessionInner,
    config: &ExecuteConfig,
    binary: bool,
    cursor_statement: Option<u32>,
    infile_depth: u8,
) -> Result<CurrentResult, Error> {
    let packet = session.read_packet(inner).await?;

    if is_err_packet(&packet.payload) {
        let err = ErrPacket::parse(&packet.payload, inner.capabilities)
            .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
        inner.status = SessionStatus::Ready;
        return Err(session.classify_server_error(err));
    }

    if is_local_infile_packet(&packet.payload) {
        if infile_depth > 0 {
            return Err(Error::Protocol(
                "nested LOCAL INFILE request".to_string(),
            ));
        }
        handle_local_infile(session, inner, &packet).await?;
        return Box::pin(read_result_head(
            session,
            inner,
            config,
            binary,
            cursor_statement,
            1,
        ))
        .await;
    }

    if let Some(ok) = OkPacket::parse(&packet.payload, inner.capabilities) {
        session.apply_ok(inner, &ok);
        return Ok(CurrentResult::UpdateCount {
            affected: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
        });
    }

    let count = parse_column_count(&packet)
        .ok_or_else(|| Error::Protocol("invalid result set header".to_string()))?;
    let (columns, cursor_exists) = session.read_columns(inner, count).await?;
    let columns: Arc<[ColumnDefinition]> = columns.into();

    let generation = session.current_generation();
    let new_cursor = |mode, binary| ResultSetCursor {
        session: session.clone(),
        columns: columns.clone(),
        rows: Vec::new(),
        position: 0,
        mode,
        binary,
        generation,
        fetch_size: config.fetch_size,
        max_rows: config.max_rows,
        delivered: 0,
        exhausted: false,
        closed: false,
        deferred_error: None,
    };

    // When a cursor was requested the metadata block ends with an OK/EOF
    // carrying SERVER_STATUS_CURSOR_EXISTS; without DEPRECATE_EOF that was
    // the column-block EOF, otherwise a dedicated terminator follows.
    let mut preloaded_row: Option<Packet> = None;
    if let Some(statement_id) = cursor_statement {
        let confirmed = match cursor_exists {
            Some(confirmed) => confirmed,
            None => {
                let next = session.read_packet(inner).await?;
                if is_err_packet(&next.payload) {
                    let err = ErrPacket::parse(&next.payload, inner.capabilities)
                        .ok_or_else(|| Error::Protocol("malformed ERR packet".to_string()))?;
                    inner.status = SessionStatus::Ready;
                    return Err(session.classify_server_error(err));
                }
                match parse_result_end(&next.payload, inner.capabilities) {
                    Some(end) if end.cursor_open => true,
                    Some(end) => {
                        // Empty inline result, no cursor opened
                        inner.chain_more_results = end.more_results;
                        inner.status = SessionStatus::Ready;
                        let mut cursor = new_cursor(FetchMode::Buffered, true);
                        cursor.exhausted = true;
                        return Ok(CurrentResult::Rows(cursor));
                    }
                    None => {
                        // The server ignored the cursor request; this packet
                        // is the first inline row
                        preloaded_row = Some(next);
                        false
                    }
                }
            }
        };

        if confirmed {
            inner.status = SessionStatus::Ready;
            debug!(
                statement_id,
                fetch_size = config.fetch_size,
                "Server cursor opened"
            );
            return Ok(CurrentResult::Rows(new_cursor(
                FetchMode::Cursor { statement_id },
                true,
            )));
        }
    }

    let streaming = config.fetch_size > 0;
    let mut cursor = new_cursor(
        if streaming {
            FetchMode::Streaming
        } else {
            FetchMode::Buffered
        },
        binary,
    );

    if let Some(packet) = preloaded_row {
        let values = if binary {
            decode_binary_row(&packet.payload, &cursor.columns)
        } else {
            decode_text_row(&packet.payload, &cursor.columns)
        }
        .ok_or_else(|| Error::Protocol("malformed row packet".to_string()))?;
        cursor.rows.push(Row {
            columns: cursor.columns.clone(),
            values,
        });
    }

    if streaming {
        inner.pending_stream = Some(PendingStream { done: false });
        debug!(fetch_size = config.fetch_size, "Streaming result opened");
        return Ok(CurrentResult::Rows(cursor));
    }

    // Buffered: read the whole result now
    loop {
        match read_row_event(session, inner, &cursor.columns, binary).await? {
            RowEvent::Row(values) => {
                // max_rows caps delivery, not buffering beyond the cap
                if cursor.max_rows == 0 || (cursor.rows.len() as u64) < cursor.max_rows {
                    cursor.rows.push(Row {
                        columns: cursor.columns.clone(),
                        values,
                    });
                }
            }
            RowEvent::End { more_results, .. } => {
                inner.chain_more_results = more_results;
                break;
            }
        }
    }
    cursor.exhausted = true;
    inner.status = SessionStatus::Ready;
    Ok(CurrentResult::Rows(cursor))
}

/// Answer a LOCAL INFILE request: stream the named file in packets, then an
/// empty packet. Refused unless allowLocalInfile is set.
async fn handle_local_infile(
    session: &Arc<SessionShared>,
    inner: &mut SessionInner,
    request: &Packet,
) -> Result<(), Error> {
    let filename = String::from_utf8_lossy(&request.payload[1..]).to_string();
    let mut seq = request.sequence_id.wrapping_add(1);

    if !session.options.allow_local_infile {
        // Terminate the exchange; the server answers with its own ERR,
        // which is read and replaced by the local refusal
        session
            .send_raw(inner, Packet::new(seq, Vec::new()))
            .await?;
        let _ = session.read_packet(inner).await?;
        return Err(Error::Unsupported(format!(
            "LOCAL INFILE '{filename}' refused (allowLocalInfile is disabled)"
        )));
    }

    debug!(file = %filename, "Answering LOCAL INFILE request");
    let data = tokio::fs::read(&filename)
        .await
        .map_err(|e| Error::Config(format!("cannot read LOCAL INFILE '{filename}': {e}")))?;

    if !data.is_empty() {
        let frames = Packet::frame_count(data.len()) as u8;
        session.send_raw(inner, Packet::new(seq, data)).await?;
        seq = seq.wrapping_add(frames);
    }
    session
        .send_raw(inner, Packet::new(seq, Vec::new()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::response::ColumnType;
    use bytes::Bytes;

    fn column(name: &str) -> ColumnDefinition {
        ColumnDefinition {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: 0x21,
            column_length: 0,
            column_type: ColumnType::VarString,
            flags: 0,
            decimals: 0,
        }
    }

    #[test]
    fn row_lookup_by_name_is_case_insensitive() {
        let columns: Arc<[ColumnDefinition]> = vec![column("id"), column("Name")].into();
        let row = Row {
            columns,
            values: vec![Value::Int(7), Value::Bytes(Bytes::from_static(b"x"))],
        };
        assert_eq!(row.get_by_name("ID"), Some(&Value::Int(7)));
        assert_eq!(row.get_i64(0), Some(7));
        assert_eq!(row.get_string(1).as_deref(), Some("x"));
        assert!(row.get_by_name("missing").is_none());
    }

    #[test]
    fn row_get_string_of_null_is_none() {
        let columns: Arc<[ColumnDefinition]> = vec![column("a")].into();
        let row = Row {
            columns,
            values: vec![Value::Null],
        };
        assert_eq!(row.get_string(0), None);
    }
}
