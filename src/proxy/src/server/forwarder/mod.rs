pub mod change_user_forward;
pub mod query_forward;
pub mod reset_conn_forward;
pub mod stmt_prepare_forward;

use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::protocol::mysql::codec::client::StmtParamDef;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::trace::CommandTrace;

use async_trait::async_trait;
use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use std::io::{Error, Write};
use tokio::io::{AsyncRead, AsyncWrite};

/// Per-command state the forwarders read and update.
pub struct ForwardContext {
    /// capabilities shared with the client
    pub client_caps: CapabilityFlags,
    /// prepared-statement metadata, statement-id → parameter definitions
    pub stmt_metadata: HashMap<u32, Vec<StmtParamDef>>,
    /// trace being recorded for the in-flight command
    pub trace: Option<CommandTrace>,
    /// finished trace of the previous traced command, what SHOW WARNINGS
    /// appends as its final row
    pub last_trace_json: Option<String>,
    /// the in-flight command is SHOW WARNINGS
    pub forwarding_show_warnings: bool,
}

impl ForwardContext {
    pub fn new(client_caps: CapabilityFlags) -> Self {
        Self {
            client_caps,
            stmt_metadata: HashMap::new(),
            trace: None,
            last_trace_json: None,
            forwarding_show_warnings: false,
        }
    }

    /// One extra warning (the trace note) rides on this command.
    pub fn warning_bump(&self) -> u16 {
        u16::from(self.trace.is_some())
    }
}

/// Forwarding logic per command family.
#[async_trait]
pub trait ComForwarder<R, W>: Send + Sync
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    /// Copy one packet from the backend to the client, preserving its
    /// sequence-id.
    async fn forward_one_packet(
        &self,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        is_flush: bool,
    ) -> Result<Packet, Error> {
        let (seq, pkt) = async_packet_read!(backend.reader);
        client_writer.set_seq(seq);
        client_writer.write_all(&pkt)?;
        client_writer.end_packet().await?;
        if is_flush {
            client_writer.flush_all().await?;
        }
        Ok(pkt)
    }

    /// Send the client's command packet to the backend. Sequence-ids
    /// restart at zero at each command boundary.
    async fn write_to_backend(
        &self,
        backend: &mut BackendConn,
        client_packet: &Packet,
    ) -> Result<(), Error> {
        backend.reset_seq();
        backend.writer.write_all(client_packet)?;
        backend.writer.end_packet().await?;
        backend.writer.flush_all().await
    }

    /// Drive the command: write it to the backend and stream the response
    /// back, updating the session tracker along the way.
    async fn forward(
        &self,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        client_packet: &Packet,
        ctx: &mut ForwardContext,
    ) -> Result<(), Error>;
}

/// Commands answered by a single OK/Error packet (ping, kill, reload,
/// set-option, statistics, debug).
pub(crate) struct GenericComForwarder;

#[async_trait]
impl<R, W> ComForwarder<R, W> for GenericComForwarder
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        _client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        client_packet: &Packet,
        _ctx: &mut ForwardContext,
    ) -> Result<(), Error> {
        <GenericComForwarder as ComForwarder<R, W>>::write_to_backend(self, backend, client_packet)
            .await?;
        let response = <GenericComForwarder as ComForwarder<R, W>>::forward_one_packet(
            self,
            client_writer,
            backend,
            true,
        )
        .await?;

        if response.is_ok_packet() {
            if let Ok((_, ok)) = crate::protocol::mysql::codec::server::Ok::decode(
                &response,
                backend.capabilities(),
            ) {
                let _ = backend.tracker.observe_ok(&ok);
            }
        }
        Ok(())
    }
}

/// Commands the server never answers (stmt-close, stmt-send-long-data).
pub(crate) struct FireAndForgetForwarder;

#[async_trait]
impl<R, W> ComForwarder<R, W> for FireAndForgetForwarder
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        _client_reader: &mut PacketReader<R>,
        _client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        client_packet: &Packet,
        _ctx: &mut ForwardContext,
    ) -> Result<(), Error> {
        <FireAndForgetForwarder as ComForwarder<R, W>>::write_to_backend(
            self,
            backend,
            client_packet,
        )
        .await
    }
}

/// Streaming relay for COM_BINLOG_DUMP: events flow until the connection
/// dies or the server sends an error; the session never returns to idle.
pub(crate) struct BinlogStreamForwarder;

#[async_trait]
impl<R, W> ComForwarder<R, W> for BinlogStreamForwarder
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        _client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        client_packet: &Packet,
        _ctx: &mut ForwardContext,
    ) -> Result<(), Error> {
        <BinlogStreamForwarder as ComForwarder<R, W>>::write_to_backend(
            self,
            backend,
            client_packet,
        )
        .await?;
        backend.mark_streaming();

        loop {
            let pkt = <BinlogStreamForwarder as ComForwarder<R, W>>::forward_one_packet(
                self,
                client_writer,
                backend,
                true,
            )
            .await?;
            if pkt.is_err_packet() {
                return Ok(());
            }
            if pkt.is_eof_packet() {
                // non-blocking dump ends with EOF
                return Ok(());
            }
        }
    }
}
