use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::backend::pool::ConnectionPool;
use crate::backend::router::DestinationRouter;
use crate::backend::ClientIdentifier;
use crate::protocol::mysql::classify::{
    classify_statement, RouterSet, StatementClassification, StatementKind,
};
use crate::protocol::mysql::codec::client as client_msg;
use crate::protocol::mysql::codec::field_type;
use crate::protocol::mysql::codec::server as server_msg;
use crate::protocol::mysql::codec::{CodecError, MessageEncode};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{writers, Packet};
use crate::protocol::mysql::session_track::SessionTracker;
use crate::server::auth::authenticator::ProxyAuthenticator;
use crate::server::auth::{gen_user_salt, CredentialCache};
use crate::server::forwarder::change_user_forward::ChangeUserForwarder;
use crate::server::forwarder::query_forward::QueryForwarder;
use crate::server::forwarder::reset_conn_forward::ResetConnForwarder;
use crate::server::forwarder::stmt_prepare_forward::StmtPrepareForwarder;
use crate::server::forwarder::{
    BinlogStreamForwarder, ComForwarder, FireAndForgetForwarder, ForwardContext,
    GenericComForwarder,
};
use crate::server::route_config::RouteConfig;
use crate::server::trace::{CommandTrace, TraceEvent};
use crate::server::{default_capabilities, ConnPhase, DEFAULT_ROUTER_VERSION};
use crate::tls::ClientSslMode;

use common::metrics;
use common::metrics::metric_def::{ROUTE_ACTIVE_CONN, ROUTE_CLIENT_CONN_TOTAL};
use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use serde_json::json;
use std::borrow::Cow;
use std::io::{self, Error, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Client-facing duplex: plain TCP or the TLS session the router
/// terminated.
pub enum FrontendStream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for FrontendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrontendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            FrontendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FrontendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FrontendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            FrontendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrontendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            FrontendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrontendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            FrontendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Where the client's backend session currently lives.
enum Attachment {
    /// exclusively checked out for this client
    Attached(Box<BackendConn>),
    /// parked in the pool/stash, to be re-acquired at the next command
    Parked,
    /// no backend yet, or it was lost
    None,
}

/// Per-client-connection state the command loop threads through.
struct ClientSession {
    id: ClientIdentifier,
    conn_id: u64,
    username: String,
    client_caps: CapabilityFlags,
    used_tls: bool,
    attachment: Attachment,
    last_endpoint: Option<String>,
    /// session-state snapshot that survives parking and reconnects
    session_state: SessionTracker,
    phase: ConnPhase,
    /// `ROUTER SET trace = 1`
    trace_enabled: bool,
    ctx: ForwardContext,
}

pub struct RouterServer {
    route: RouteConfig,
    router: DestinationRouter,
    pool: Arc<ConnectionPool>,
    credentials: Arc<CredentialCache>,
    authenticator: ProxyAuthenticator,
    conn_counter: AtomicU64,
    active_connections: AtomicU64,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl RouterServer {
    pub fn new(
        route: RouteConfig,
        pool: Arc<ConnectionPool>,
        credentials: Arc<CredentialCache>,
    ) -> io::Result<Self> {
        #[cfg(feature = "tls")]
        let tls_acceptor = match (&route.tls_cert_path, &route.tls_key_path) {
            (Some(cert), Some(key))
                if route.client_ssl_mode != ClientSslMode::Disabled
                    && route.client_ssl_mode != ClientSslMode::Passthrough =>
            {
                Some(crate::tls::tls_acceptor(crate::tls::server_tls_config(
                    cert, key,
                )?))
            }
            _ => None,
        };

        if route.client_ssl_mode == ClientSslMode::Required {
            #[cfg(feature = "tls")]
            if tls_acceptor.is_none() {
                return Err(Error::new(
                    io::ErrorKind::InvalidInput,
                    "client_ssl_mode=REQUIRED needs tls_cert/tls_key",
                ));
            }
            #[cfg(not(feature = "tls"))]
            return Err(Error::new(
                io::ErrorKind::InvalidInput,
                "client_ssl_mode=REQUIRED needs the tls feature",
            ));
        }

        let router = DestinationRouter::new(route.destinations.clone(), route.strategy);
        Ok(Self {
            route,
            router,
            pool,
            credentials,
            authenticator: ProxyAuthenticator,
            conn_counter: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            #[cfg(feature = "tls")]
            tls_acceptor,
        })
    }

    pub fn route_name(&self) -> &str {
        &self.route.name
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Drive one client connection from accept to close.
    pub async fn connect(&self, stream: TcpStream) -> Result<(), Error> {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        metrics::gauge(
            ROUTE_ACTIVE_CONN,
            self.active_connections.load(Ordering::Relaxed) as f64,
            None,
        );
        metrics::counter_inc(ROUTE_CLIENT_CONN_TOTAL, None);

        let result = if self.route.client_ssl_mode == ClientSslMode::Passthrough {
            self.run_passthrough(stream).await
        } else {
            self.run_terminated(stream).await
        };

        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge(
            ROUTE_ACTIVE_CONN,
            self.active_connections.load(Ordering::Relaxed) as f64,
            None,
        );
        result
    }

    /// PASSTHROUGH: the router is a TCP relay. No decoding, no sharing, no
    /// tracing; it only pairs the client with a backend.
    async fn run_passthrough(&self, mut client: TcpStream) -> Result<(), Error> {
        let Some(destination) = self.router.candidates().into_iter().next() else {
            return Err(Error::new(io::ErrorKind::NotConnected, "no destinations"));
        };

        let mut backend = TcpStream::connect(&destination.addr).await?;
        debug!(
            "passthrough relay {} <-> {}",
            client.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
            destination.addr
        );
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Terminated mode: full handshake, auth brokering, command pipeline.
    async fn run_terminated(&self, stream: TcpStream) -> Result<(), Error> {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let scramble = gen_user_salt();

        // compression is client-side only; the router↔server link stays
        // uncompressed.
        let mut advertised = default_capabilities() | CapabilityFlags::CLIENT_COMPRESS;
        #[cfg(feature = "tls")]
        if self.tls_acceptor.is_some() {
            advertised |= CapabilityFlags::CLIENT_SSL;
        }

        let mut client_reader = PacketReader::new(FrontendStream::Tcp(stream));

        // S0: greet the client over the plain socket
        let mut greeting_writer = PacketWriter::new(Vec::new());
        writers::write_initial_handshake(
            &mut greeting_writer,
            conn_id,
            scramble,
            DEFAULT_ROUTER_VERSION,
            advertised,
        )
        .await?;
        let greeting_bytes = greeting_writer.into_inner();
        {
            use tokio::io::AsyncWriteExt;
            client_reader.r.write_all(&greeting_bytes).await?;
            client_reader.r.flush().await?;
        }

        // S2 (or S1 first): the client's greeting response
        let (mut greeting_seq, first_pkt) = async_packet_read!(client_reader);
        let (_, first_greeting) = client_msg::Greeting::decode(&first_pkt, advertised)
            .map_err(writers::codec_to_io)?;

        let wants_tls = first_greeting
            .capabilities
            .contains(CapabilityFlags::CLIENT_SSL);

        let mut used_tls = false;
        let client_greeting: client_msg::Greeting<'static>;

        #[cfg(feature = "tls")]
        let mut client_reader = if wants_tls {
            let Some(acceptor) = self.tls_acceptor.clone() else {
                let mut writer = PacketWriter::new(client_reader.r);
                writers::write_err_packet(
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    b"TLS requested but not available on this route",
                    &mut writer,
                )
                .await?;
                return Ok(());
            };
            // S1: nothing may sit buffered when the TLS handshake starts
            if !client_reader.buffered().is_empty() {
                return Err(Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected bytes before TLS handshake",
                ));
            }
            let FrontendStream::Tcp(tcp) = client_reader.into_inner() else {
                return Err(Error::new(io::ErrorKind::InvalidData, "already TLS"));
            };
            let tls_stream = acceptor.accept(tcp).await?;
            used_tls = true;
            PacketReader::new(FrontendStream::Tls(Box::new(tls_stream)))
        } else {
            client_reader
        };

        #[cfg(not(feature = "tls"))]
        let mut client_reader = client_reader;

        if wants_tls && used_tls {
            // the real greeting arrives encrypted
            let (seq, pkt) = async_packet_read!(client_reader);
            greeting_seq = seq;
            let (_, greeting) = client_msg::Greeting::decode(&pkt, advertised)
                .map_err(writers::codec_to_io)?;
            client_greeting = greeting.into_owned();
        } else if wants_tls {
            // client asked for TLS but the route cannot terminate it
            return Ok(());
        } else {
            if self.route.client_ssl_mode == ClientSslMode::Required {
                let mut writer = PacketWriter::new(client_reader.r);
                writers::write_err_packet(
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    b"this route requires TLS",
                    &mut writer,
                )
                .await?;
                return Ok(());
            }
            client_greeting = first_greeting.into_owned();
        }

        let client_caps = advertised & client_greeting.capabilities;
        let username = String::from_utf8_lossy(&client_greeting.username).into_owned();
        info!(
            "route {} client {conn_id} user {username:?} tls={used_tls}",
            self.route.name
        );

        // S3: first backend
        let backend = match self.connect_backend_with_retry().await {
            Ok(backend) => backend,
            Err(e) => {
                let mut writer = PacketWriter::new(client_reader.r);
                writers::write_err_packet(
                    ErrorKind::CR_CONN_HOST_ERROR,
                    format!("Can't connect to MySQL server ({e})").as_bytes(),
                    &mut writer,
                )
                .await?;
                return Ok(());
            }
        };

        // split the duplex so reads and writes can interleave freely
        let (read_half, write_half) = tokio::io::split(client_reader.into_inner());
        let mut client_reader = PacketReader::new(read_half);
        let mut client_writer = PacketWriter::new(write_half);

        // S4: broker the authentication exchange
        let backend = match self
            .authenticator
            .pair_client_with_backend(
                backend,
                &mut client_reader,
                &mut client_writer,
                &client_greeting,
                greeting_seq,
                used_tls,
                self.route.server_ssl_mode.resolve(used_tls),
                &self.credentials,
            )
            .await
        {
            Ok(backend) => backend,
            Err(e) => {
                debug!("auth brokering failed for {username:?}: {e}");
                return Ok(());
            }
        };

        let mut session = ClientSession {
            id: ClientIdentifier::new(),
            conn_id,
            username,
            client_caps,
            used_tls,
            attachment: Attachment::Attached(Box::new(backend)),
            last_endpoint: None,
            session_state: SessionTracker::new(),
            phase: ConnPhase::Ready,
            trace_enabled: false,
            ctx: ForwardContext::new(client_caps),
        };
        if let Attachment::Attached(backend) = &session.attachment {
            session.last_endpoint = Some(backend.endpoint().to_string());
        }

        let loop_result = if client_caps.contains(CapabilityFlags::CLIENT_COMPRESS) {
            // compressed framing starts right after the auth exchange
            use crate::protocol::mysql::packet::compressed::CompressedStream;
            let leftover = client_reader.buffered().to_vec();
            let mut compressed_reader = PacketReader::new(CompressedStream::with_leftover(
                client_reader.into_inner(),
                leftover,
            ));
            let mut compressed_writer =
                PacketWriter::new(CompressedStream::new(client_writer.into_inner()));
            self.command_loop(&mut session, &mut compressed_reader, &mut compressed_writer)
                .await
        } else {
            self.command_loop(&mut session, &mut client_reader, &mut client_writer)
                .await
        };

        // client is gone: release everything it owned
        self.pool.discard_all_stashed(&session.id).await;
        match std::mem::replace(&mut session.attachment, Attachment::None) {
            Attachment::Attached(backend) => {
                if session.phase != ConnPhase::Error
                    && backend.tracker.sharable()
                    && !backend.is_streaming()
                {
                    self.pool.add(*backend).await;
                } else {
                    backend.quit_and_close().await;
                }
            }
            Attachment::Parked | Attachment::None => {}
        }

        loop_result
    }

    /// S5/S6/S7/S8: commands until the client hangs up.
    async fn command_loop<R, W>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        loop {
            session.phase = match session.attachment {
                Attachment::Attached(_) => ConnPhase::Ready,
                _ => ConnPhase::Parked,
            };

            let Some((seq, pkt)) = client_reader.next_async().await? else {
                debug!("client {} disconnected", session.conn_id);
                return Ok(());
            };
            if pkt.is_empty() {
                writers::write_err_packet(
                    ErrorKind::ER_MALFORMED_PACKET,
                    b"Malformed communication packet",
                    client_writer,
                )
                .await?;
                continue;
            }

            client_writer.set_seq(seq.wrapping_add(1));
            session.phase = ConnPhase::ForwardingCommand;
            session.ctx.trace = None;
            session.ctx.forwarding_show_warnings = false;

            let com = CommandCode::from_u8(pkt[0]);
            match com {
                Some(CommandCode::ComQuit) => {
                    debug!("client {} quit", session.conn_id);
                    return Ok(());
                }
                Some(CommandCode::ComQuery) => {
                    self.on_query(session, client_reader, client_writer, &pkt)
                        .await?;
                }
                Some(CommandCode::ComStmtPrepare) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &StmtPrepareForwarder,
                    )
                    .await?;
                }
                Some(CommandCode::ComStmtExecute) => {
                    self.on_stmt_execute(session, client_reader, client_writer, &pkt)
                        .await?;
                }
                Some(CommandCode::ComStmtClose) => {
                    if let Ok((_, close)) =
                        client_msg::StmtClose::decode(&pkt, session.client_caps)
                    {
                        session.ctx.stmt_metadata.remove(&close.statement_id);
                    }
                    let had_backend = matches!(session.attachment, Attachment::Attached(_));
                    if had_backend {
                        self.forward_command(
                            session,
                            client_reader,
                            client_writer,
                            &pkt,
                            &FireAndForgetForwarder,
                        )
                        .await?;
                        if let Attachment::Attached(backend) = &mut session.attachment {
                            backend.tracker.note_prepared_statement_closed();
                        }
                    }
                }
                Some(CommandCode::ComStmtSendLongData) => {
                    if let Ok((_, append)) =
                        client_msg::StmtParamAppendData::decode(&pkt, session.client_caps)
                    {
                        if let Some(defs) =
                            session.ctx.stmt_metadata.get_mut(&append.statement_id)
                        {
                            if let Some(def) = defs.get_mut(append.param_id as usize) {
                                def.param_already_sent = true;
                            }
                        }
                    }
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &FireAndForgetForwarder,
                    )
                    .await?;
                }
                Some(CommandCode::ComStmtFetch) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &QueryForwarder {
                            com_code: CommandCode::ComStmtFetch,
                        },
                    )
                    .await?;
                }
                Some(CommandCode::ComFieldList) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &QueryForwarder {
                            com_code: CommandCode::ComFieldList,
                        },
                    )
                    .await?;
                }
                Some(CommandCode::ComChangeUser) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &ChangeUserForwarder,
                    )
                    .await?;
                    if let Attachment::Attached(backend) = &session.attachment {
                        session.session_state = backend.tracker.clone();
                        if let Some(user) = backend.auth_username() {
                            session.username = user.to_string();
                        }
                    }
                }
                Some(CommandCode::ComResetConnection) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &ResetConnForwarder,
                    )
                    .await?;
                    if let Attachment::Attached(backend) = &session.attachment {
                        session.session_state = backend.tracker.clone();
                    }
                }
                Some(CommandCode::ComSetOption) => {
                    let multi_on = client_msg::SetOption::decode(&pkt, session.client_caps)
                        .map(|(_, opt)| opt.option == 0)
                        .unwrap_or(false);
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &GenericComForwarder,
                    )
                    .await?;
                    if let Attachment::Attached(backend) = &mut session.attachment {
                        backend.tracker.set_multi_statement_mode(multi_on);
                    }
                }
                Some(CommandCode::ComBinlogDump) | Some(CommandCode::ComBinlogDumpGtid) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &BinlogStreamForwarder,
                    )
                    .await?;
                    // the backend never returns to idle after a dump
                    if let Attachment::Attached(backend) =
                        std::mem::replace(&mut session.attachment, Attachment::None)
                    {
                        backend.quit_and_close().await;
                    }
                    return Ok(());
                }
                Some(CommandCode::ComProcessInfo) => {
                    // SHOW PROCESSLIST over the wire: a full resultset
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &QueryForwarder {
                            com_code: CommandCode::ComProcessInfo,
                        },
                    )
                    .await?;
                }
                Some(CommandCode::ComInitDB)
                | Some(CommandCode::ComPing)
                | Some(CommandCode::ComStatistics)
                | Some(CommandCode::ComDebug)
                | Some(CommandCode::ComRefresh)
                | Some(CommandCode::ComProcessKill)
                | Some(CommandCode::ComRegisterReplica)
                | Some(CommandCode::ComStmtReset) => {
                    self.forward_command(
                        session,
                        client_reader,
                        client_writer,
                        &pkt,
                        &GenericComForwarder,
                    )
                    .await?;
                }
                _ => {
                    writers::write_err_packet(
                        ErrorKind::ER_UNKNOWN_COM_ERROR,
                        b"Unknown command",
                        client_writer,
                    )
                    .await?;
                }
            }

            self.park_if_sharable(session).await;
        }
    }

    /// COM_QUERY: classification, router interception, tracing, forward.
    async fn on_query<R, W>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        pkt: &Packet,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let decoded = client_msg::Query::decode(pkt, session.client_caps);
        let query = match decoded {
            Ok((_, query)) => query,
            Err(_) => {
                return writers::write_err_packet(
                    ErrorKind::ER_MALFORMED_PACKET,
                    b"Malformed communication packet",
                    client_writer,
                )
                .await;
            }
        };

        // router.* query attributes override the session trace bit
        let mut trace_override: Option<bool> = None;
        let mut user_params: Vec<client_msg::QueryParam<'_>> = Vec::new();
        for param in &query.params {
            let name = String::from_utf8_lossy(&param.name);
            if name.eq_ignore_ascii_case("router.trace") {
                let is_tiny = (param.type_and_flags & 0xff) as u8 == field_type::TINY;
                let value = param.value.as_deref().and_then(|v| v.first().copied());
                match (is_tiny, value) {
                    (true, Some(0)) => trace_override = Some(false),
                    (true, Some(1)) => trace_override = Some(true),
                    _ => {
                        return writers::write_err_packet(
                            ErrorKind::ER_PARSE_ERROR,
                            b"router.trace must be a TINY 0 or 1",
                            client_writer,
                        )
                        .await;
                    }
                }
            } else if name.to_ascii_lowercase().starts_with("router.") {
                return writers::write_err_packet(
                    ErrorKind::ER_PARSE_ERROR,
                    format!("unknown router attribute {name:?}").as_bytes(),
                    client_writer,
                )
                .await;
            } else {
                user_params.push(param.clone());
            }
        }

        let classification = classify_statement(&query.statement);

        // ROUTER SET never reaches the backend
        if let StatementKind::RouterSet(router_set) = &classification.kind {
            return match router_set {
                RouterSet::Trace(on) => {
                    session.trace_enabled = *on;
                    writers::write_simple_ok(client_writer, session.client_caps).await
                }
                RouterSet::Malformed => {
                    writers::write_err_packet(
                        ErrorKind::ER_PARSE_ERROR,
                        b"syntax error in ROUTER statement",
                        client_writer,
                    )
                    .await
                }
            };
        }

        if classification.is_multi_statement && self.route.connection_sharing {
            return writers::write_err_packet(
                ErrorKind::ER_MULTI_STMT_WHILE_SHARING,
                b"multi-statements are forbidden while connection-sharing is active",
                client_writer,
            )
            .await;
        }

        let trace_active = trace_override.unwrap_or(session.trace_enabled);
        session.ctx.forwarding_show_warnings = matches!(
            classification.kind,
            StatementKind::ShowWarnings | StatementKind::ShowWarningCount
        );

        if trace_active {
            let mut trace = CommandTrace::start();
            let mut classify_event = TraceEvent::new("mysql/query_classify");
            classify_event.attr(
                "mysql.query.tainting",
                json!(classification.blocks_sharing()),
            );
            classify_event.finish();
            trace.push_event(classify_event);
            trace.set_sharing_blocked(
                classification.blocks_sharing()
                    || !session.session_state.taints().is_empty(),
            );
            session.ctx.trace = Some(trace);
        } else {
            session.ctx.trace = None;
        }

        // rebuild the payload when router attributes were stripped
        let outbound: Packet = if user_params.len() != query.params.len() {
            let rewritten = client_msg::Query {
                params: user_params,
                statement: Cow::Borrowed(&query.statement),
            };
            let backend_caps = match &session.attachment {
                Attachment::Attached(backend) => backend.capabilities(),
                _ => session.client_caps,
            };
            Packet::from_vec(
                rewritten
                    .encode_to_vec(backend_caps)
                    .map_err(writers::codec_to_io)?,
            )
        } else {
            pkt.clone()
        };

        let forward_result = self
            .forward_classified(
                session,
                client_reader,
                client_writer,
                &outbound,
                Some(&classification),
            )
            .await;

        // finish the trace; SHOW WARNINGS returns it as its final row
        if let Some(mut trace) = session.ctx.trace.take() {
            if forward_result.is_err() {
                trace.set_failed();
            }
            trace.set_remote_connected(matches!(
                session.attachment,
                Attachment::Attached(_)
            ));
            session.ctx.last_trace_json = Some(trace.to_json());
        }

        forward_result
    }

    /// COM_STMT_EXECUTE: validate against the known statement metadata
    /// before forwarding.
    async fn on_stmt_execute<R, W>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        pkt: &Packet,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let metadata = &session.ctx.stmt_metadata;
        let decode_result = client_msg::StmtExecute::decode(pkt, session.client_caps, |id| {
            metadata.get(&id).cloned()
        });

        match decode_result {
            Ok(_) => {}
            Err(CodecError::StatementIdNotFound) => {
                return writers::write_err_packet(
                    ErrorKind::ER_UNKNOWN_STMT_HANDLER,
                    b"Unknown prepared statement handler given to mysqld_stmt_execute",
                    client_writer,
                )
                .await;
            }
            Err(_) => {
                return writers::write_err_packet(
                    ErrorKind::ER_MALFORMED_PACKET,
                    b"Malformed communication packet",
                    client_writer,
                )
                .await;
            }
        }

        self.forward_classified(
            session,
            client_reader,
            client_writer,
            pkt,
            None,
        )
        .await
    }

    /// Attach a backend (S7→S5, possibly S8) and run the forwarder,
    /// converting transport losses into the client-visible 2013.
    async fn forward_command<R, W, F>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        pkt: &Packet,
        forwarder: &F,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
        F: ComForwarder<R, W>,
    {
        self.forward_with(session, client_reader, client_writer, pkt, forwarder, None)
            .await
    }

    async fn forward_classified<R, W>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        pkt: &Packet,
        classification: Option<&StatementClassification>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let forwarder = QueryForwarder {
            com_code: if pkt.command_byte() == Some(CommandCode::ComStmtExecute as u8) {
                CommandCode::ComStmtExecute
            } else {
                CommandCode::ComQuery
            },
        };
        self.forward_with(
            session,
            client_reader,
            client_writer,
            pkt,
            &forwarder,
            classification,
        )
        .await
    }

    async fn forward_with<R, W, F>(
        &self,
        session: &mut ClientSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        pkt: &Packet,
        forwarder: &F,
        classification: Option<&StatementClassification>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
        F: ComForwarder<R, W>,
    {
        if let Err(e) = self.ensure_attached(session).await {
            warn!(
                "client {} could not (re)acquire a backend: {e}",
                session.conn_id
            );
            return writers::write_err_packet(
                ErrorKind::CR_CONN_HOST_ERROR,
                format!("Can't connect to MySQL server ({e})").as_bytes(),
                client_writer,
            )
            .await;
        }

        let mut forward_event = TraceEvent::new("mysql/connect_and_forward");

        let Attachment::Attached(backend) = &mut session.attachment else {
            return Err(Error::new(io::ErrorKind::NotConnected, "no backend"));
        };

        if let Some(classification) = classification {
            backend.tracker.apply_classification(classification);
        }

        let result = forwarder
            .forward(client_reader, client_writer, backend, pkt, &mut session.ctx)
            .await;

        forward_event.finish();
        if let Some(trace) = session.ctx.trace.as_mut() {
            trace.push_event(forward_event);
        }

        match result {
            Ok(()) => {
                session.session_state = backend.tracker.clone();
                Ok(())
            }
            Err(e) => {
                // either the backend violated the protocol or the
                // transport died mid-command; the backend is unusable in
                // both cases and never goes back to the pool
                session.phase = ConnPhase::Error;
                warn!(
                    "client {} lost backend {} mid-command: {e}",
                    session.conn_id,
                    backend.endpoint()
                );
                let malformed = e.kind() == io::ErrorKind::InvalidData;
                if let Attachment::Attached(backend) =
                    std::mem::replace(&mut session.attachment, Attachment::None)
                {
                    backend.quit_and_close().await;
                }
                if malformed {
                    writers::write_err_packet(
                        ErrorKind::ER_MALFORMED_PACKET,
                        b"Malformed communication packet",
                        client_writer,
                    )
                    .await
                } else {
                    writers::write_err_packet(
                        ErrorKind::CR_SERVER_LOST,
                        b"Lost connection to MySQL server during query",
                        client_writer,
                    )
                    .await
                }
            }
        }
    }

    /// Make sure a backend is attached: the stash (mine first), the pool,
    /// or a fresh connection authenticated from the credential cache.
    async fn ensure_attached(&self, session: &mut ClientSession) -> Result<(), Error> {
        if matches!(session.attachment, Attachment::Attached(_)) {
            return Ok(());
        }
        session.phase = ConnPhase::AcquiringBackend;

        let endpoint = session
            .last_endpoint
            .clone()
            .or_else(|| self.router.candidates().first().map(|b| b.addr.clone()))
            .ok_or_else(|| Error::new(io::ErrorKind::NotConnected, "no destinations"))?;

        // my own stashed session comes back untouched
        if let Some(backend) = self.pool.unstash_mine(&endpoint, &session.id) {
            debug!("client {} reattached to stashed backend", session.conn_id);
            session.attachment = Attachment::Attached(Box::new(backend));
            return Ok(());
        }

        // any same-account session whose sharing delay has elapsed
        let username = session.username.clone();
        if let Some(mut backend) =
            self.pool
                .unstash_if(&endpoint, |conn| conn.auth_username() == Some(username.as_str()), false)
        {
            self.restore_session_state(&mut backend, session).await?;
            session.attachment = Attachment::Attached(Box::new(backend));
            return Ok(());
        }

        if let Some(mut backend) = self.pool.pop(&endpoint) {
            if backend.auth_username() == Some(username.as_str()) {
                self.reset_backend_session(&mut backend).await?;
                self.restore_session_state(&mut backend, session).await?;
                session.attachment = Attachment::Attached(Box::new(backend));
                return Ok(());
            }
            // wrong account: re-target it if the cache allows, else put it
            // back for its own kind
            if let Some(creds) = self.credentials.get(&username) {
                if creds.cleartext_password.is_some() {
                    self.authenticator
                        .change_user_from_cache(&mut backend, &creds)
                        .await?;
                    self.restore_session_state(&mut backend, session).await?;
                    session.attachment = Attachment::Attached(Box::new(backend));
                    return Ok(());
                }
            }
            if let Some(backend) = self.pool.add_if_not_full(backend) {
                backend.quit_and_close().await;
            }
        }

        // S8: fresh connection from cached credentials
        session.phase = ConnPhase::Reconnecting;
        metrics::counter_inc(
            common::metrics::metric_def::BACKEND_RECONNECT_TOTAL,
            None,
        );
        let creds = self
            .credentials
            .get(&session.username)
            .filter(|c| c.cleartext_password.is_some())
            .ok_or_else(|| {
                Error::new(
                    io::ErrorKind::PermissionDenied,
                    "no cached credentials for reconnect",
                )
            })?;

        let raw = self.connect_backend_with_retry().await?;
        let mut backend = self
            .authenticator
            .authenticate_from_cache(
                raw,
                &creds,
                self.route.server_ssl_mode.resolve(session.used_tls),
            )
            .await?;
        self.restore_session_state(&mut backend, session).await?;
        session.last_endpoint = Some(backend.endpoint().to_string());
        session.attachment = Attachment::Attached(Box::new(backend));
        Ok(())
    }

    /// COM_RESET_CONNECTION on reuse; replies are invisible to the client.
    async fn reset_backend_session(&self, backend: &mut BackendConn) -> Result<(), Error> {
        writers::write_reset_connection(&mut backend.writer).await?;
        let (_, response) = async_packet_read!(backend.reader);
        if response.is_err_packet() {
            return Err(Error::new(
                io::ErrorKind::InvalidData,
                "reset-connection failed on reuse",
            ));
        }
        backend.tracker.reset();
        Ok(())
    }

    /// Replay recorded session state (SET statements and the schema) on a
    /// reassigned or fresh backend. Replies never reach the client.
    async fn restore_session_state(
        &self,
        backend: &mut BackendConn,
        session: &ClientSession,
    ) -> Result<(), Error> {
        for statement in session.session_state.restoration_commands() {
            writers::write_query_request(&mut backend.writer, statement.as_bytes()).await?;
            self.drain_replay_response(backend).await?;
        }
        if let Some(schema) = session.session_state.schema() {
            writers::write_init_schema(&mut backend.writer, schema.as_bytes()).await?;
            self.drain_replay_response(backend).await?;
        }
        backend.tracker = session.session_state.clone();
        Ok(())
    }

    /// Swallow the response of an injected replay command.
    async fn drain_replay_response(&self, backend: &mut BackendConn) -> Result<(), Error> {
        let (_, response) = async_packet_read!(backend.reader);
        if response.is_err_packet() {
            let (_, err) = server_msg::Error::decode(&response, backend.capabilities())
                .map_err(writers::codec_to_io)?;
            return Err(Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "session replay failed: {}",
                    String::from_utf8_lossy(&err.message)
                ),
            ));
        }
        // replayed statements produce a single OK; resultsets are not
        // replayed
        Ok(())
    }

    /// S5→S7: park the backend when the tracker allows sharing.
    async fn park_if_sharable(&self, session: &mut ClientSession) {
        if !self.route.connection_sharing {
            return;
        }
        let sharable = match &session.attachment {
            Attachment::Attached(backend) => {
                backend.tracker.sharable() && !backend.is_streaming()
            }
            _ => false,
        };
        if !sharable {
            return;
        }

        if let Attachment::Attached(backend) =
            std::mem::replace(&mut session.attachment, Attachment::Parked)
        {
            debug!("client {} parked its backend", session.conn_id);
            session.last_endpoint = Some(backend.endpoint().to_string());
            self.pool.stash(
                *backend,
                session.id.clone(),
                self.route.connection_sharing_delay,
            );
        }
    }

    /// Connect to the route's destinations, retrying within
    /// `connect_retry_timeout` (zero disables the retry).
    pub(crate) async fn connect_backend_with_retry(&self) -> Result<BackendConn, Error> {
        let deadline = tokio::time::Instant::now() + self.route.connect_retry_timeout;
        let mut last_err: Option<Error> = None;

        loop {
            for destination in self.router.candidates() {
                match BackendConn::connect(&destination.addr).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        debug!("connect to {} failed: {e}", destination.addr);
                        last_err = Some(e);
                    }
                }
            }

            if self.route.connect_retry_timeout.is_zero()
                || tokio::time::Instant::now() >= deadline
            {
                return Err(last_err.unwrap_or_else(|| {
                    Error::new(io::ErrorKind::NotConnected, "no destinations")
                }));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pool::{ConnectionPool, PoolConfig};
    use crate::backend::BackendInstance;
    use crate::server::route_config::RouteConfig;
    use crate::server::trace::TRACE_WARNING_CODE;

    fn test_server(sharing: bool) -> RouterServer {
        let route = RouteConfig {
            destinations: vec![BackendInstance::new("127.0.0.1:9")],
            connection_sharing: sharing,
            connect_retry_timeout: Duration::ZERO,
            client_ssl_mode: ClientSslMode::Disabled,
            ..RouteConfig::default()
        };
        RouterServer::new(
            route,
            ConnectionPool::new(PoolConfig::default()),
            CredentialCache::new(),
        )
        .expect("test server")
    }

    fn test_caps() -> CapabilityFlags {
        default_capabilities() | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
    }

    fn test_session() -> ClientSession {
        ClientSession {
            id: ClientIdentifier::new(),
            conn_id: 1,
            username: "app".to_string(),
            client_caps: test_caps(),
            used_tls: false,
            attachment: Attachment::None,
            last_endpoint: None,
            session_state: SessionTracker::new(),
            phase: ConnPhase::Ready,
            trace_enabled: false,
            ctx: ForwardContext::new(test_caps()),
        }
    }

    async fn run_query(
        server: &RouterServer,
        session: &mut ClientSession,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        let (client, _keep) = tokio::io::duplex(1024);
        let mut reader = PacketReader::new(client);
        let mut writer = PacketWriter::new(Vec::new());
        server
            .on_query(session, &mut reader, &mut writer, &Packet::from_vec(payload))
            .await
            .expect("on_query");
        writer.into_inner()
    }

    fn first_payload(raw: Vec<u8>) -> Packet {
        let mut reader =
            crate::protocol::mysql::packet::packet_reader::PacketReader::new(
                std::io::Cursor::new(raw),
            );
        reader.next_read().expect("frame").expect("payload").1
    }

    fn error_code_of(pkt: &Packet) -> u16 {
        assert!(pkt.is_err_packet());
        u16::from_le_bytes([pkt[1], pkt[2]])
    }

    fn query_packet(sql: &str) -> Vec<u8> {
        let query = client_msg::Query::new(sql.as_bytes());
        query.encode_to_vec(test_caps()).expect("encode")
    }

    fn query_packet_with_trace_attr(sql: &str, value: u8, tiny: bool) -> Vec<u8> {
        let query = client_msg::Query {
            params: vec![client_msg::QueryParam {
                type_and_flags: if tiny {
                    u16::from(field_type::TINY)
                } else {
                    u16::from(field_type::VAR_STRING)
                },
                name: Cow::Borrowed(b"router.trace"),
                value: Some(Cow::Owned(vec![value])),
            }],
            statement: Cow::Borrowed(sql.as_bytes()),
        };
        query.encode_to_vec(test_caps()).expect("encode")
    }

    #[tokio::test]
    async fn router_set_trace_is_intercepted() {
        let server = test_server(false);
        let mut session = test_session();

        let out = run_query(&server, &mut session, query_packet("ROUTER SET trace = 1")).await;
        let pkt = first_payload(out);
        assert!(pkt.is_ok_packet());
        assert!(session.trace_enabled);

        let out = run_query(&server, &mut session, query_packet("ROUTER SET trace = 0")).await;
        assert!(first_payload(out).is_ok_packet());
        assert!(!session.trace_enabled);
    }

    #[tokio::test]
    async fn malformed_router_statement_is_a_parse_error() {
        let server = test_server(false);
        let mut session = test_session();

        let out = run_query(&server, &mut session, query_packet("ROUTER SET trace = 2")).await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::ER_PARSE_ERROR as u16
        );
    }

    #[tokio::test]
    async fn multi_statement_refused_while_sharing() {
        let server = test_server(true);
        let mut session = test_session();

        let out = run_query(&server, &mut session, query_packet("SELECT 1; SELECT 2")).await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::ER_MULTI_STMT_WHILE_SHARING as u16
        );

        // without sharing the statement would have been forwarded; with no
        // reachable backend that surfaces as 2003 instead
        let server = test_server(false);
        let out = run_query(&server, &mut session, query_packet("SELECT 1; SELECT 2")).await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::CR_CONN_HOST_ERROR as u16
        );
    }

    #[tokio::test]
    async fn trace_attribute_overrides_session_bit() {
        let server = test_server(false);
        let mut session = test_session();
        session.trace_enabled = false;

        // attribute turns tracing on for this one statement; the backend
        // is unreachable, so the command fails, but the trace is recorded
        let out = run_query(
            &server,
            &mut session,
            query_packet_with_trace_attr("SELECT 1", 1, true),
        )
        .await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::CR_CONN_HOST_ERROR as u16
        );

        let trace_json = session.ctx.last_trace_json.clone().expect("trace recorded");
        let doc: serde_json::Value = serde_json::from_str(&trace_json).unwrap();
        assert_eq!(doc["attributes"]["mysql.sharing_blocked"], false);
        assert_eq!(doc["attributes"]["mysql.remote.is_connected"], false);
        assert_eq!(doc["events"][0]["name"], "mysql/query_classify");

        // session bit on, attribute 0 turns it off for this statement
        session.trace_enabled = true;
        session.ctx.last_trace_json = None;
        let _ = run_query(
            &server,
            &mut session,
            query_packet_with_trace_attr("SELECT 1", 0, true),
        )
        .await;
        assert!(session.ctx.last_trace_json.is_none());
    }

    #[tokio::test]
    async fn bad_trace_attribute_is_a_parse_error() {
        let server = test_server(false);
        let mut session = test_session();

        // wrong type
        let out = run_query(
            &server,
            &mut session,
            query_packet_with_trace_attr("SELECT 1", 1, false),
        )
        .await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::ER_PARSE_ERROR as u16
        );

        // wrong value
        let out = run_query(
            &server,
            &mut session,
            query_packet_with_trace_attr("SELECT 1", 7, true),
        )
        .await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::ER_PARSE_ERROR as u16
        );
    }

    #[tokio::test]
    async fn unknown_router_attribute_is_a_parse_error() {
        let server = test_server(false);
        let mut session = test_session();

        let query = client_msg::Query {
            params: vec![client_msg::QueryParam {
                type_and_flags: u16::from(field_type::TINY),
                name: Cow::Borrowed(b"router.verbosity"),
                value: Some(Cow::Owned(vec![1])),
            }],
            statement: Cow::Borrowed(b"SELECT 1"),
        };
        let payload = query.encode_to_vec(test_caps()).expect("encode");
        let out = run_query(&server, &mut session, payload).await;
        assert_eq!(
            error_code_of(&first_payload(out)),
            ErrorKind::ER_PARSE_ERROR as u16
        );
    }

    #[tokio::test]
    async fn trace_note_code_is_4600() {
        assert_eq!(TRACE_WARNING_CODE, 4600);
    }

    #[tokio::test]
    async fn connect_retry_gives_up_without_retry_timeout() {
        let server = test_server(false);
        let started = std::time::Instant::now();
        assert!(server.connect_backend_with_retry().await.is_err());
        // zero retry-timeout means a single pass over the destinations
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
