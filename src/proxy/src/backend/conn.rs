use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::packet::Packet;
use crate::protocol::mysql::session_track::SessionTracker;

use mysql_common::constants::CapabilityFlags;
use nanoid::nanoid;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

/// Raw duplex toward an upstream server: TCP, unix socket, or a TLS
/// session over either.
pub enum BackendStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl BackendStream {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        #[cfg(unix)]
        if addr.starts_with('/') {
            return Ok(BackendStream::Unix(UnixStream::connect(addr).await?));
        }
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        Ok(BackendStream::Tcp(tcp))
    }

    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        if matches!(self, BackendStream::Tls(_)) {
            return true;
        }
        false
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One authenticated server-side session.
///
/// Owns the framing pair, the negotiated capabilities, and the session
/// tracker that decides whether the session may be pooled.
pub struct BackendConn {
    pub id: String,
    endpoint: String,
    pub reader: PacketReader<ReadHalf<BackendStream>>,
    pub writer: PacketWriter<WriteHalf<BackendStream>>,
    caps: CapabilityFlags,
    server_version: Vec<u8>,
    connection_id: u32,
    tls: bool,
    /// COM_BINLOG_DUMP puts the server into a stream it never leaves.
    streaming: bool,
    /// account this session is authenticated as
    auth_username: Option<String>,
    pub tracker: SessionTracker,
}

impl BackendConn {
    pub fn new(endpoint: String, stream: BackendStream) -> Self {
        let tls = stream.is_tls();
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            id: nanoid!(),
            endpoint,
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            caps: CapabilityFlags::empty(),
            server_version: Vec::new(),
            connection_id: 0,
            tls,
            streaming: false,
            auth_username: None,
            tracker: SessionTracker::new(),
        }
    }

    pub async fn connect(endpoint: &str) -> io::Result<Self> {
        let stream = BackendStream::connect(endpoint).await?;
        Ok(Self::new(endpoint.to_string(), stream))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.caps
    }

    pub fn set_capabilities(&mut self, caps: CapabilityFlags) {
        self.caps = caps;
    }

    pub fn server_version(&self) -> &[u8] {
        &self.server_version
    }

    pub fn set_server_version(&mut self, version: Vec<u8>) {
        self.server_version = version;
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: u32) {
        self.connection_id = id;
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn auth_username(&self) -> Option<&str> {
        self.auth_username.as_deref()
    }

    pub fn set_auth_username(&mut self, username: String) {
        self.auth_username = Some(username);
    }

    pub fn mark_streaming(&mut self) {
        self.streaming = true;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Swap the plain TCP stream for its TLS-wrapped self mid-handshake.
    ///
    /// Framing state survives: sequence-ids keep counting across the
    /// upgrade, and nothing may sit buffered when it happens.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(
        self,
        connector: tokio_rustls::TlsConnector,
        domain: tokio_rustls::rustls::pki_types::ServerName<'static>,
    ) -> io::Result<Self> {
        debug_assert!(self.reader.buffered().is_empty());

        let BackendConn {
            id,
            endpoint,
            reader,
            writer,
            caps,
            server_version,
            connection_id,
            tls: _,
            streaming,
            auth_username,
            tracker,
        } = self;

        let seq = writer.seq();
        let stream = reader.into_inner().unsplit(writer.into_inner());
        let tcp = match stream {
            BackendStream::Tcp(tcp) => tcp,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "tls upgrade needs a plain tcp stream",
                ))
            }
        };

        let tls_stream = connector.connect(domain, tcp).await?;
        let mut upgraded =
            BackendConn::new(endpoint, BackendStream::Tls(Box::new(tls_stream)));
        upgraded.id = id;
        upgraded.caps = caps;
        upgraded.server_version = server_version;
        upgraded.connection_id = connection_id;
        upgraded.streaming = streaming;
        upgraded.auth_username = auth_username;
        upgraded.tracker = tracker;
        upgraded.writer.set_seq(seq);
        Ok(upgraded)
    }

    pub fn reset_seq(&mut self) {
        self.writer.reset_seq();
    }

    pub async fn recv_packet(&mut self) -> io::Result<Option<(u8, Packet)>> {
        self.reader.next_async().await
    }

    /// A pooled connection must be silent. Any pending byte, EOF, or error
    /// from the server means the entry is dead.
    pub fn is_idle_and_live(&mut self) -> bool {
        use futures::FutureExt;
        use tokio::io::AsyncReadExt;

        let mut probe = [0u8; 1];
        match self.reader.r.read(&mut probe).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => false,
            Some(Err(_)) => false,
        }
    }

    /// Graceful close: best-effort COM_QUIT, TLS shutdown alert when a TLS
    /// session is up, half-close, then a short wait for the FIN to leave
    /// before the socket drops.
    pub async fn quit_and_close(mut self) {
        if writers::write_quit(&mut self.writer).await.is_err() {
            debug!("backend {} ignored COM_QUIT", self.endpoint);
        }

        // shutdown() emits the TLS close_notify on a TLS stream and
        // half-closes the raw socket either way.
        let shutdown_ok = self.writer.inner_writer.shutdown().await.is_ok();
        if shutdown_ok {
            // if shutdown failed the peer is already gone; otherwise give
            // the quit-msg a moment to leave.
            use tokio::io::AsyncReadExt;
            let mut probe = [0u8; 1];
            let _ = tokio::time::timeout(
                Duration::from_millis(1),
                self.reader.r.read(&mut probe),
            )
            .await;
        }
        // dropping the halves closes the socket
    }
}
