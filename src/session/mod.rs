//! Session state machine.
//!
//! A session owns its socket exclusively. The wire protocol is strictly
//! half-duplex, so every command round trip runs under the session-scoped
//! mutex; cancellation is the sole cross-thread operation and always uses an
//! independent connection.

mod state;
mod stream;

pub use state::{IsolationLevel, SessionState};
pub use stream::{NetworkStream, WireCodec};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionOptions;
use crate::error::{Error, ServerError, ER_QUERY_INTERRUPTED};
use crate::metrics::metrics;
use crate::protocol::auth::{
    self, encode_password, AuthPlugin, CredentialProvider, PasswordCredentials,
    CACHING_SHA2_FAST_AUTH_SUCCESS, CACHING_SHA2_FULL_AUTH_REQUIRED, REQUEST_PUBLIC_KEY,
};
use crate::protocol::handshake::{
    AuthMoreData, AuthSwitchRequest, HandshakeResponse, InitialHandshake, SslRequest,
    AUTH_MORE_DATA, AUTH_SWITCH_REQUEST,
};
use crate::protocol::packet::{capabilities::*, Command, Packet, MAX_PACKET_SIZE};
use crate::protocol::response::{
    is_err_packet, is_ok_packet, ColumnDefinition, ErrPacket, OkPacket,
};
use crate::result::Execution;
use crate::statement::{CachedStatement, PreparedStatement};
use crate::url::{ConnectionUrl, HostAddress};

/// Lifecycle states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Authenticating,
    /// Transient: following a server-issued redirect during authentication
    Redirecting,
    Ready,
    Executing,
    Closed,
}

/// Per-statement execution knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteConfig {
    /// Rows per fetch round trip; 0 means fetch-all (buffered)
    pub fetch_size: u32,
    /// Client-side row cap; 0 means unlimited
    pub max_rows: u64,
    /// Client-side watchdog for the whole execution
    pub query_timeout: Option<Duration>,
}

/// Marker for a streaming result whose rows are still on the wire
pub(crate) struct PendingStream {
    pub done: bool,
}

pub(crate) struct SessionInner {
    framed: Framed<NetworkStream, WireCodec>,
    pub status: SessionStatus,
    pub state: SessionState,
    pub capabilities: u32,
    pub max_allowed_packet: usize,
    /// A streaming result still being pulled off the wire
    pub pending_stream: Option<PendingStream>,
    /// The last result terminator carried SERVER_MORE_RESULTS_EXISTS
    pub chain_more_results: bool,
    /// Watchdog for the command currently executing
    pub current_timeout: Option<Duration>,
}

impl SessionInner {
    /// Reset per-command sequence bookkeeping on the codec (compressed
    /// framing counts per command).
    pub(crate) fn start_command_frame(&mut self) {
        self.framed.codec_mut().start_command();
    }
}

pub(crate) struct SessionShared {
    pub connection_id: u32,
    pub host: HostAddress,
    pub database: Option<String>,
    pub options: ConnectionOptions,
    pub credentials: Arc<dyn CredentialProvider>,
    pub server_version: String,
    pub is_mariadb: bool,
    pub inner: Mutex<SessionInner>,
    /// Bumped on every command; streaming cursors check it for staleness
    pub generation: AtomicU64,
    pub cancel_requested: AtomicBool,
    pub closed: AtomicBool,
    /// Per-session prepared statement cache (SQL text -> handle metadata)
    pub stmt_cache: DashMap<String, CachedStatement>,
}

impl SessionShared {
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::ResourceClosed("Connection"))
        } else {
            Ok(())
        }
    }

    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, SessionInner>, Error> {
        self.ensure_open()?;
        Ok(self.inner.lock().await)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self, inner: &mut SessionInner) {
        inner.status = SessionStatus::Closed;
        self.closed.store(true, Ordering::Release);
        metrics().record_session_closed();
    }

    /// Classify a server ERR. A kill outcome is a cancellation only when
    /// this session actually asked for one.
    pub(crate) fn classify_server_error(&self, err: ErrPacket) -> Error {
        if err.error_code == ER_QUERY_INTERRUPTED
            && self.cancel_requested.swap(false, Ordering::AcqRel)
        {
            return Error::Cancelled;
        }
        Error::Server(ServerError::from(err))
    }

    /// Fail fast when an outbound payload would exceed max_allowed_packet.
    pub(crate) fn preflight(
        &self,
        inner: &SessionInner,
        payload_len: usize,
        context: impl FnOnce() -> String,
    ) -> Result<(), Error> {
        if payload_len > inner.max_allowed_packet {
            return Err(Error::PacketTooLarge {
                size: payload_len,
                max: inner.max_allowed_packet,
                context: context(),
            });
        }
        Ok(())
    }

    /// Send one command packet. Drains any undrained streaming result first
    /// (the wire is half-duplex), resets sequence bookkeeping, bumps the
    /// command generation.
    pub(crate) async fn send_command(
        &self,
        inner: &mut SessionInner,
        packet: Packet,
    ) -> Result<(), Error> {
        self.drain_pending_stream(inner).await?;
        inner.framed.codec_mut().start_command();
        inner.status = SessionStatus::Executing;
        self.bump_generation();
        inner.chain_more_results = false;
        if let Err(e) = inner.framed.send(packet).await {
            self.mark_closed(inner);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Send a packet without the new-command bookkeeping: continuation
    /// frames of an in-flight exchange (cursor fetches, LOCAL INFILE data).
    pub(crate) async fn send_raw(
        &self,
        inner: &mut SessionInner,
        packet: Packet,
    ) -> Result<(), Error> {
        if let Err(e) = inner.framed.send(packet).await {
            self.mark_closed(inner);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Read one packet, applying the effective watchdog. Timeouts and socket
    /// errors close the session.
    pub(crate) async fn read_packet(&self, inner: &mut SessionInner) -> Result<Packet, Error> {
        let timeout = inner.current_timeout.or(self.options.socket_timeout());

        let next = async {
            match inner.framed.next().await {
                Some(Ok(packet)) => Ok(packet),
                Some(Err(e)) => Err(Error::Io(e)),
                None => Err(Error::Disconnected),
            }
        };

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, next).await {
                Ok(r) => r,
                Err(_) => {
                    // The response is in an unknown position; the socket is
                    // unusable. Fire a best-effort kill and close.
                    self.mark_closed(inner);
                    self.spawn_kill();
                    return Err(Error::Timeout(limit));
                }
            },
            None => next.await,
        };

        match result {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.mark_closed(inner);
                Err(e)
            }
        }
    }

    /// Apply an OK packet's session-track payload and status bits through
    /// the single mirror entry point.
    pub(crate) fn apply_ok(&self, inner: &mut SessionInner, ok: &OkPacket) {
        inner.state.apply_delta(&ok.state_changes);
        inner.state.apply_status(ok.in_transaction(), ok.autocommit());
        if let Some(value) = inner.state.system_variable("max_allowed_packet") {
            if let Ok(max) = value.parse::<usize>() {
                inner.max_allowed_packet = max;
            }
        }
        inner.chain_more_results = ok.more_results();
        inner.status = SessionStatus::Ready;
    }

    /// Read and discard the rest of the current streaming result (up to its
    /// terminator), leaving the chain more-results flag intact. The cursor
    /// that owned the stream observes staleness through the generation
    /// counter.
    pub(crate) async fn drain_current_result(
        &self,
        inner: &mut SessionInner,
    ) -> Result<(), Error> {
        let Some(pending) = inner.pending_stream.take() else {
            return Ok(());
        };
        if pending.done {
            return Ok(());
        }
        debug!(
            host = %self.host,
            "Discarding undrained streaming result"
        );
        loop {
            let packet = self.read_packet(inner).await?;
            if is_err_packet(&packet.payload) {
                // The stream died server-side; the wire is clean again
                inner.chain_more_results = false;
                return Ok(());
            }
            if let Some(end) = parse_result_end(&packet.payload, inner.capabilities) {
                inner.chain_more_results = end.more_results;
                return Ok(());
            }
        }
    }

    /// Free the wire for the next command: drain the current streaming
    /// result and every unread result remaining in the chain.
    pub(crate) async fn drain_pending_stream(
        &self,
        inner: &mut SessionInner,
    ) -> Result<(), Error> {
        self.drain_current_result(inner).await?;
        self.discard_chain(inner).await
    }

    /// Discard every remaining result in a multi-result chain.
    pub(crate) async fn discard_chain(&self, inner: &mut SessionInner) -> Result<(), Error> {
        while inner.chain_more_results {
            inner.chain_more_results = false;
            let head = self.read_packet(inner).await?;
            if is_err_packet(&head.payload) {
                return Ok(());
            }
            if let Some(ok) = OkPacket::parse(&head.payload, inner.capabilities) {
                inner.chain_more_results = ok.more_results();
                continue;
            }
            // Result set: columns then rows until the terminator
            let mut reading_rows = false;
            loop {
                let packet = self.read_packet(inner).await?;
                if is_err_packet(&packet.payload) {
                    return Ok(());
                }
                if let Some(end) = parse_result_end(&packet.payload, inner.capabilities) {
                    if reading_rows || inner.capabilities & CLIENT_DEPRECATE_EOF != 0 {
                        inner.chain_more_results = end.more_results;
                        break;
                    }
                    // First EOF just closes the column block
                    reading_rows = true;
                }
            }
        }
        Ok(())
    }

    /// Read the column definition block of a result set header. The second
    /// element reports whether the closing EOF carried
    /// SERVER_STATUS_CURSOR_EXISTS (None when the protocol has no EOF
    /// there).
    pub(crate) async fn read_columns(
        &self,
        inner: &mut SessionInner,
        count: u64,
    ) -> Result<(Vec<ColumnDefinition>, Option<bool>), Error> {
        use crate::protocol::packet::status::SERVER_STATUS_CURSOR_EXISTS;
        use crate::protocol::response::EofPacket;

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let packet = self.read_packet(inner).await?;
            let column = ColumnDefinition::parse(&packet.payload)
                .ok_or_else(|| Error::Protocol("invalid column definition".to_string()))?;
            columns.push(column);
        }
        let mut cursor_exists = None;
        if inner.capabilities & CLIENT_DEPRECATE_EOF == 0 {
            // EOF closes the column block
            let packet = self.read_packet(inner).await?;
            if let Some(eof) = EofPacket::parse(&packet.payload) {
                cursor_exists =
                    Some(eof.status_flags & SERVER_STATUS_CURSOR_EXISTS != 0);
            }
        }
        Ok((columns, cursor_exists))
    }

    /// Best-effort KILL QUERY from an independent connection.
    fn spawn_kill(&self) {
        let options = self.options.clone();
        let credentials = self.credentials.clone();
        let host = self.host.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            if let Err(e) =
                kill_query(&options, credentials, &host, connection_id).await
            {
                warn!(connection_id, error = %e, "Best-effort kill failed");
            }
        });
    }
}

/// Terminator of a result-row block: OK (DEPRECATE_EOF) or EOF, either way
/// carrying the more-results flag.
pub(crate) struct ResultEnd {
    pub more_results: bool,
    pub cursor_exhausted: bool,
    /// SERVER_STATUS_CURSOR_EXISTS: the server opened a cursor and rows
    /// come via COM_STMT_FETCH
    pub cursor_open: bool,
}

pub(crate) fn parse_result_end(payload: &bytes::Bytes, capabilities: u32) -> Option<ResultEnd> {
    use crate::protocol::packet::status;
    use crate::protocol::response::EofPacket;

    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        if !payload.is_empty() && payload[0] == 0xFE && payload.len() < MAX_PACKET_SIZE {
            let ok = OkPacket::parse(payload, capabilities)?;
            return Some(ResultEnd {
                more_results: ok.more_results(),
                cursor_exhausted: ok.status_flags & status::SERVER_STATUS_LAST_ROW_SENT != 0,
                cursor_open: ok.status_flags & status::SERVER_STATUS_CURSOR_EXISTS != 0,
            });
        }
        None
    } else {
        let eof = EofPacket::parse(payload)?;
        Some(ResultEnd {
            more_results: eof.more_results(),
            cursor_exhausted: eof.cursor_exhausted(),
            cursor_open: eof.status_flags & status::SERVER_STATUS_CURSOR_EXISTS != 0,
        })
    }
}

/// Connection factory. Credentials are an explicit value here, never a
/// process-wide lookup.
#[derive(Clone)]
pub struct Connector {
    options: ConnectionOptions,
    credentials: Arc<dyn CredentialProvider>,
}

impl Connector {
    pub fn new(options: ConnectionOptions) -> Self {
        let credentials = Arc::new(PasswordCredentials {
            user: options.user.clone(),
            password: options.password.clone(),
        });
        Self {
            options,
            credentials,
        }
    }

    pub fn with_credentials(
        options: ConnectionOptions,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            options,
            credentials,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Establish a session: TCP connect, handshake, authentication,
    /// optional TLS and compression, optional redirect.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn connect(
        &self,
        host: &HostAddress,
        database: Option<&str>,
    ) -> Result<Session, Error> {
        self.connect_with_redirect(host, database, 0).await
    }

    async fn connect_with_redirect(
        &self,
        host: &HostAddress,
        database: Option<&str>,
        redirect_depth: u8,
    ) -> Result<Session, Error> {
        let addr = host.addr();
        debug!(addr = %addr, "Connecting");

        let tcp = tokio::time::timeout(
            self.options.connect_timeout(),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| Error::Timeout(self.options.connect_timeout()))??;
        tcp.set_nodelay(true).ok();

        let mut framed = Framed::new(NetworkStream::Plain(tcp), WireCodec::plain());

        // Server greeting
        let greeting = match framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => return Err(Error::Io(e)),
            None => return Err(Error::Disconnected),
        };
        if is_err_packet(&greeting.payload) {
            let err = ErrPacket::parse(&greeting.payload, 0)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            return Err(Error::Auth(err.error_message));
        }
        let handshake = InitialHandshake::parse(&greeting.payload)
            .ok_or_else(|| Error::Protocol("invalid server greeting".to_string()))?;

        debug!(
            server_version = %handshake.server_version,
            auth_plugin = %handshake.auth_plugin_name,
            "Received server greeting"
        );

        let (framed, negotiated, ok) = authenticate(
            framed,
            &handshake,
            host,
            &self.options,
            self.credentials.as_ref(),
            database,
        )
        .await?;

        // Switch to compressed framing only after the auth exchange
        let framed = if negotiated & CLIENT_COMPRESS != 0 {
            framed.map_codec(|_| WireCodec::compressed())
        } else {
            framed
        };

        let mut state = SessionState::new(database.map(str::to_string));
        state.apply_delta(&ok.state_changes);
        state.apply_status(ok.in_transaction(), ok.autocommit());

        // Server-issued redirect, announced on the authentication OK
        if let Some(target) = state.take_redirect() {
            if self.options.enable_redirect {
                if redirect_depth > 0 {
                    return Err(Error::Redirect(format!(
                        "redirect loop via {target}"
                    )));
                }
                info!(target = %target, "Following server redirect");
                let redirect_host = parse_redirect_target(&target)
                    .ok_or_else(|| Error::Redirect(format!("unparseable target {target}")))?;
                // Original connection is abandoned; the server asked us to go
                drop(framed);
                return match Box::pin(self.connect_with_redirect(
                    &redirect_host,
                    database,
                    redirect_depth + 1,
                ))
                .await
                {
                    Ok(session) => Ok(session),
                    Err(e) => Err(Error::Redirect(e.to_string())),
                };
            }
        }

        metrics().record_session_opened();
        info!(
            connection_id = handshake.connection_id,
            server_version = %handshake.server_version,
            "Session established"
        );

        let inner = SessionInner {
            framed,
            status: SessionStatus::Ready,
            state,
            capabilities: negotiated,
            max_allowed_packet: self.options.max_allowed_packet,
            pending_stream: None,
            chain_more_results: false,
            current_timeout: None,
        };

        Ok(Session {
            shared: Arc::new(SessionShared {
                connection_id: handshake.connection_id,
                host: host.clone(),
                database: database.map(str::to_string),
                options: self.options.clone(),
                credentials: self.credentials.clone(),
                server_version: handshake.server_version.clone(),
                is_mariadb: handshake.is_mariadb(),
                inner: Mutex::new(inner),
                generation: AtomicU64::new(0),
                cancel_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stmt_cache: DashMap::new(),
            }),
        })
    }
}

/// A redirect target looks like `mysql://host:port` (or bare `host:port`).
fn parse_redirect_target(target: &str) -> Option<HostAddress> {
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    let rest = rest.split(['/', '?']).next()?;
    let url = ConnectionUrl::parse(&format!("mysql://{rest}")).ok()?;
    url.hosts.into_iter().next()
}

/// Run the authentication exchange. Returns the upgraded transport, the
/// negotiated capabilities and the final OK.
async fn authenticate(
    mut framed: Framed<NetworkStream, WireCodec>,
    handshake: &InitialHandshake,
    host: &HostAddress,
    options: &ConnectionOptions,
    credentials: &dyn CredentialProvider,
    database: Option<&str>,
) -> Result<(Framed<NetworkStream, WireCodec>, u32, OkPacket), Error> {
    let (user, password) = credentials.credentials()?;
    let password_bytes = match &password {
        Some(p) => encode_password(p, &options.password_character_encoding)?,
        None => Vec::new(),
    };

    let mut requested = BASE_CAPABILITIES;
    if database.is_some() {
        requested |= CLIENT_CONNECT_WITH_DB;
    }
    if options.use_compression {
        requested |= CLIENT_COMPRESS;
    }
    if options.allow_local_infile {
        requested |= CLIENT_LOCAL_FILES;
    }
    if options.allow_multi_queries {
        requested |= CLIENT_MULTI_STATEMENTS;
    }
    let mut negotiated = requested & handshake.capability_flags;
    // PROTOCOL_41 and SECURE_CONNECTION are not optional for this engine
    if negotiated & CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::Unsupported(
            "server does not speak protocol 4.1".to_string(),
        ));
    }

    // First reply to the greeting carries sequence 1
    let mut seq: u8 = 1;

    // TLS before any credentials leave the machine
    if options.ssl_enabled() {
        if handshake.capability_flags & CLIENT_SSL == 0 {
            return Err(Error::Tls("server does not support TLS".to_string()));
        }
        negotiated |= CLIENT_SSL;
        let request = SslRequest {
            capability_flags: negotiated,
            max_packet_size: MAX_PACKET_SIZE as u32,
            character_set: UTF8MB4_CHARSET,
        };
        framed
            .send(request.encode(seq))
            .await
            .map_err(Error::Io)?;
        seq = seq.wrapping_add(1);

        let parts = framed.into_parts();
        let io = parts.io.upgrade_tls(&host.host, options).await?;
        let mut new_parts = FramedParts::new::<Packet>(io, parts.codec);
        new_parts.read_buf = parts.read_buf;
        framed = Framed::from_parts(new_parts);
    }

    let tls_active = negotiated & CLIENT_SSL != 0;
    let mut plugin =
        AuthPlugin::from_name(&handshake.auth_plugin_name).unwrap_or(AuthPlugin::NativePassword);
    if options.credential_type.eq_ignore_ascii_case("gssapi") {
        plugin = AuthPlugin::Gssapi;
    }
    let mut nonce = handshake.auth_plugin_data();

    let auth_response = plugin.scramble(&password_bytes, &nonce)?;

    let response = HandshakeResponse {
        capability_flags: negotiated,
        max_packet_size: MAX_PACKET_SIZE as u32,
        character_set: UTF8MB4_CHARSET,
        username: user.clone(),
        auth_response,
        database: database.map(str::to_string),
        auth_plugin_name: plugin.name().to_string(),
    };
    framed
        .send(response.encode(seq))
        .await
        .map_err(Error::Io)?;

    // Server-driven rounds: auth switch, more-data, then OK or ERR
    let mut awaiting_public_key = false;
    loop {
        let packet = match framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => return Err(Error::Io(e)),
            None => return Err(Error::Disconnected),
        };
        seq = packet.sequence_id.wrapping_add(1);

        if is_err_packet(&packet.payload) {
            let err = ErrPacket::parse(&packet.payload, negotiated)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            return Err(Error::Auth(err.error_message));
        }

        if packet.payload.first() == Some(&AUTH_SWITCH_REQUEST) && packet.payload.len() > 1 {
            let switch = AuthSwitchRequest::parse(&packet.payload)
                .ok_or_else(|| Error::Protocol("invalid auth switch".to_string()))?;
            debug!(plugin = %switch.plugin_name, "Auth switch requested");
            plugin = AuthPlugin::from_name(&switch.plugin_name)?;
            nonce = switch.plugin_data.clone();
            awaiting_public_key = false;

            let reply = match plugin {
                AuthPlugin::NativePassword | AuthPlugin::CachingSha2Password => {
                    plugin.scramble(&password_bytes, &nonce)?
                }
                AuthPlugin::Sha256Password => sha256_reply(
                    &password_bytes,
                    &nonce,
                    tls_active,
                    options,
                    &mut awaiting_public_key,
                )?,
                AuthPlugin::Gssapi => {
                    let principal = String::from_utf8_lossy(&nonce).to_string();
                    credentials.gssapi_token(&principal)?
                }
            };
            framed
                .send(Packet::new(seq, reply))
                .await
                .map_err(Error::Io)?;
            continue;
        }

        if packet.payload.first() == Some(&AUTH_MORE_DATA) && packet.payload.len() > 1 {
            let more = AuthMoreData::parse(&packet.payload)
                .ok_or_else(|| Error::Protocol("invalid auth data".to_string()))?;

            if awaiting_public_key {
                // The requested RSA public key, PEM-encoded
                let pem = String::from_utf8_lossy(&more.data).to_string();
                let encrypted = auth::encrypt_password(&password_bytes, &nonce, &pem, plugin)?;
                framed
                    .send(Packet::new(seq, encrypted))
                    .await
                    .map_err(Error::Io)?;
                awaiting_public_key = false;
                continue;
            }

            match more.data.first() {
                Some(&CACHING_SHA2_FAST_AUTH_SUCCESS) => {
                    // Fast path: the OK packet follows
                    continue;
                }
                Some(&CACHING_SHA2_FULL_AUTH_REQUIRED) => {
                    if tls_active {
                        // Cleartext password over the encrypted channel
                        let mut cleartext = password_bytes.clone();
                        cleartext.push(0);
                        framed
                            .send(Packet::new(seq, cleartext))
                            .await
                            .map_err(Error::Io)?;
                    } else if let Some(path) = &options.server_rsa_public_key_file {
                        let pem = std::fs::read_to_string(path).map_err(|e| {
                            Error::Auth(format!("cannot read RSA key file {path}: {e}"))
                        })?;
                        let encrypted =
                            auth::encrypt_password(&password_bytes, &nonce, &pem, plugin)?;
                        framed
                            .send(Packet::new(seq, encrypted))
                            .await
                            .map_err(Error::Io)?;
                    } else if options.allow_public_key_retrieval {
                        framed
                            .send(Packet::new(seq, vec![REQUEST_PUBLIC_KEY]))
                            .await
                            .map_err(Error::Io)?;
                        awaiting_public_key = true;
                    } else {
                        return Err(Error::Auth(
                            "RSA public key is not available client side \
                             (allowPublicKeyRetrieval is disabled)"
                                .to_string(),
                        ));
                    }
                    continue;
                }
                _ => {
                    // sha256_password servers answer the key request with
                    // the bare PEM, no indicator byte
                    if more.data.starts_with(b"-----BEGIN") {
                        let pem = String::from_utf8_lossy(&more.data).to_string();
                        let encrypted =
                            auth::encrypt_password(&password_bytes, &nonce, &pem, plugin)?;
                        framed
                            .send(Packet::new(seq, encrypted))
                            .await
                            .map_err(Error::Io)?;
                        continue;
                    }
                    return Err(Error::Protocol(
                        "unexpected auth continuation".to_string(),
                    ));
                }
            }
        }

        if is_ok_packet(&packet.payload) || packet.payload.first() == Some(&0xFE) {
            let ok = OkPacket::parse(&packet.payload, negotiated)
                .ok_or_else(|| Error::Protocol("invalid auth OK".to_string()))?;
            return Ok((framed, negotiated, ok));
        }

        return Err(Error::Protocol(format!(
            "unexpected packet 0x{:02x} during authentication",
            packet.payload.first().copied().unwrap_or(0)
        )));
    }
}

/// Initial sha256_password response after an auth switch
fn sha256_reply(
    password: &[u8],
    nonce: &[u8],
    tls_active: bool,
    options: &ConnectionOptions,
    awaiting_public_key: &mut bool,
) -> Result<Vec<u8>, Error> {
    if password.is_empty() {
        return Ok(vec![0]);
    }
    if tls_active {
        let mut cleartext = password.to_vec();
        cleartext.push(0);
        return Ok(cleartext);
    }
    if let Some(path) = &options.server_rsa_public_key_file {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| Error::Auth(format!("cannot read RSA key file {path}: {e}")))?;
        return Ok(auth::encrypt_password(
            password,
            nonce,
            &pem,
            AuthPlugin::Sha256Password,
        )?);
    }
    if options.allow_public_key_retrieval {
        *awaiting_public_key = true;
        // 0x01 asks sha256_password servers for their public key
        return Ok(vec![0x01]);
    }
    Err(Error::Auth(
        "RSA public key is not available client side \
         (allowPublicKeyRetrieval is disabled)"
            .to_string(),
    ))
}

const UTF8MB4_CHARSET: u8 = 45; // utf8mb4_general_ci

/// An established session
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn shared_arc(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub(crate) fn shared_options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn connection_id(&self) -> u32 {
        self.shared.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.shared.server_version
    }

    pub fn is_mariadb(&self) -> bool {
        self.shared.is_mariadb
    }

    pub fn host(&self) -> &HostAddress {
        &self.shared.host
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the mirrored session state
    pub async fn state(&self) -> SessionState {
        match self.shared.lock().await {
            Ok(inner) => inner.state.clone(),
            Err(_) => SessionState::default(),
        }
    }

    /// Execute with default settings (buffered, no row cap, no watchdog)
    pub async fn execute(&self, sql: &str) -> Result<Execution, Error> {
        self.execute_with(sql, ExecuteConfig::default()).await
    }

    /// Execute a text-protocol statement (or several when multi-statement
    /// mode is on).
    #[instrument(skip(self, sql), fields(connection_id = self.shared.connection_id, sql_preview = %truncate_sql(sql, 100)))]
    pub async fn execute_with(
        &self,
        sql: &str,
        config: ExecuteConfig,
    ) -> Result<Execution, Error> {
        if sql.contains(';')
            && !self.shared.options.allow_multi_queries
            && crate::parser::split_statements(sql).len() > 1
        {
            return Err(Error::Unsupported(
                "multi-statement execution requires allowMultiQueries".to_string(),
            ));
        }

        let mut inner = self.shared.lock().await?;
        inner.current_timeout = config.query_timeout;

        let payload_len = 1 + sql.len();
        self.shared
            .preflight(&inner, payload_len, || {
                format!("query: {}", truncate_sql(sql, 100))
            })?;

        self.shared
            .send_command(&mut inner, Command::Query.packet(sql.as_bytes()))
            .await?;

        metrics().record_command("query");
        Execution::from_wire(self.shared.clone(), inner, config, false, None).await
    }

    /// Prepare a statement server-side
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement, Error> {
        PreparedStatement::prepare(self.shared.clone(), sql).await
    }

    /// Health probe
    pub async fn ping(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock().await?;
        inner.current_timeout = None;
        self.shared
            .send_command(&mut inner, Command::Ping.bare())
            .await?;
        let packet = self.shared.read_packet(&mut inner).await?;
        if let Some(ok) = OkPacket::parse(&packet.payload, inner.capabilities) {
            self.shared.apply_ok(&mut inner, &ok);
            Ok(())
        } else {
            self.shared.mark_closed(&mut inner);
            Err(Error::Protocol("unexpected ping response".to_string()))
        }
    }

    /// Reset server-side session state (COM_RESET_CONNECTION)
    pub async fn reset(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock().await?;
        inner.current_timeout = None;
        self.shared
            .send_command(&mut inner, Command::ResetConnection.bare())
            .await?;
        let packet = self.shared.read_packet(&mut inner).await?;
        match OkPacket::parse(&packet.payload, inner.capabilities) {
            Some(ok) => {
                self.shared.apply_ok(&mut inner, &ok);
                Ok(())
            }
            None => {
                let err = ErrPacket::parse(&packet.payload, inner.capabilities)
                    .map(|e| self.shared.classify_server_error(e))
                    .unwrap_or_else(|| Error::Protocol("unexpected reset response".to_string()));
                Err(err)
            }
        }
    }

    /// Switch the default schema (COM_INIT_DB)
    pub async fn change_catalog(&self, catalog: &str) -> Result<(), Error> {
        let mut inner = self.shared.lock().await?;
        inner.current_timeout = None;
        self.shared
            .send_command(&mut inner, Command::InitDb.packet(catalog.as_bytes()))
            .await?;
        let packet = self.shared.read_packet(&mut inner).await?;
        match OkPacket::parse(&packet.payload, inner.capabilities) {
            Some(ok) => {
                self.shared.apply_ok(&mut inner, &ok);
                // The server may not track schema; mirror it explicitly
                inner.state.catalog = Some(catalog.to_string());
                Ok(())
            }
            None => {
                let err = ErrPacket::parse(&packet.payload, inner.capabilities)
                    .map(|e| self.shared.classify_server_error(e))
                    .unwrap_or_else(|| Error::Protocol("unexpected response".to_string()));
                Err(err)
            }
        }
    }

    /// Cancel the in-flight query from another task. Opens an independent
    /// connection and issues KILL QUERY; never touches this session's
    /// socket, which may be blocked mid-read.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.shared.cancel_requested.store(true, Ordering::Release);
        kill_query(
            &self.shared.options,
            self.shared.credentials.clone(),
            &self.shared.host,
            self.shared.connection_id,
        )
        .await
    }

    /// Close the session (best-effort COM_QUIT)
    pub async fn close(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        let mut inner = self.shared.inner.lock().await;
        let _ = inner.framed.send(Command::Quit.bare()).await;
        self.shared.mark_closed(&mut inner);
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.shared.connection_id)
            .field("host", &self.shared.host)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open a short-lived connection and kill the target query.
async fn kill_query(
    options: &ConnectionOptions,
    credentials: Arc<dyn CredentialProvider>,
    host: &HostAddress,
    connection_id: u32,
) -> Result<(), Error> {
    let mut kill_options = options.clone();
    // The kill connection must not chase redirects or compression
    kill_options.enable_redirect = false;
    kill_options.use_compression = false;

    let connector = Connector::with_credentials(kill_options, credentials);
    let session = connector.connect(host, None).await?;
    let result = session
        .execute(&format!("KILL QUERY {connection_id}"))
        .await;
    session.close().await.ok();
    result.map(|_| ())
}

/// Truncate SQL for logging and error context
pub(crate) fn truncate_sql(sql: &str, max_len: usize) -> std::borrow::Cow<'_, str> {
    if sql.len() <= max_len {
        std::borrow::Cow::Borrowed(sql)
    } else {
        let mut end = max_len;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        std::borrow::Cow::Owned(format!("{}...", &sql[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_target_parsing() {
        let host = parse_redirect_target("mysql://other.example.com:3307").unwrap();
        assert_eq!(host.host, "other.example.com");
        assert_eq!(host.port, 3307);

        let host = parse_redirect_target("replica:4000").unwrap();
        assert_eq!(host.host, "replica");
        assert_eq!(host.port, 4000);

        let host = parse_redirect_target("mysql://just-a-host").unwrap();
        assert_eq!(host.port, crate::url::DEFAULT_PORT);

        assert!(parse_redirect_target("").is_none());
    }

    #[test]
    fn truncate_sql_appends_ellipsis() {
        assert_eq!(truncate_sql("SELECT 1", 100), "SELECT 1");
        let long = "x".repeat(150);
        let truncated = truncate_sql(&long, 100);
        assert_eq!(truncated.len(), 103);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn truncate_sql_respects_char_boundaries() {
        let sql = "SELECT '😀😀😀😀'";
        // A cut in the middle of the emoji must back off to a boundary
        let truncated = truncate_sql(sql, 9);
        assert!(truncated.ends_with("..."));
    }
}
