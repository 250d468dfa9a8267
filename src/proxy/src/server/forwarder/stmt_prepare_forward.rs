use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::protocol::mysql::codec::client::StmtParamDef;
use crate::protocol::mysql::codec::server::{ColumnMeta, StmtPrepareOk};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::codec_to_io;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{ComForwarder, ForwardContext};

use async_trait::async_trait;
use mysql_common::constants::CapabilityFlags;
use std::io::{Error, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// COM_STMT_PREPARE: forwards the response and captures the parameter
/// definitions, which later COM_STMT_EXECUTE decoding needs.
pub struct StmtPrepareForwarder;

impl StmtPrepareForwarder {
    async fn copy_packet<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        seq: u8,
        pkt: &Packet,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        client_writer.set_seq(seq);
        client_writer.write_all(pkt)?;
        client_writer.end_packet().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> ComForwarder<R, W> for StmtPrepareForwarder
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
        ctx: &mut ForwardContext,
    ) -> Result<(), Error> {
        <StmtPrepareForwarder as ComForwarder<R, W>>::write_to_backend(
            self,
            backend,
            client_packet,
        )
        .await?;

        let backend_caps = backend.capabilities();
        let (seq, head) = async_packet_read!(backend.reader);

        if head.is_err_packet() {
            self.copy_packet(client_writer, seq, &head).await?;
            client_writer.flush_all().await?;
            return Ok(());
        }

        let (_, prepare_ok) =
            StmtPrepareOk::decode(&head, backend_caps).map_err(codec_to_io)?;
        self.copy_packet(client_writer, seq, &head).await?;

        let mut params = Vec::with_capacity(prepare_ok.param_count as usize);
        if prepare_ok.param_count > 0 && prepare_ok.with_metadata {
            for _ in 0..prepare_ok.param_count {
                let (meta_seq, meta_pkt) = async_packet_read!(backend.reader);
                let (_, meta) =
                    ColumnMeta::decode(&meta_pkt, backend_caps).map_err(codec_to_io)?;
                params.push(StmtParamDef {
                    type_and_flags: u16::from(meta.column_type),
                    name: meta.name.to_vec(),
                    param_already_sent: false,
                });
                self.copy_packet(client_writer, meta_seq, &meta_pkt).await?;
            }
            if !backend_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                let (eof_seq, eof_pkt) = async_packet_read!(backend.reader);
                self.copy_packet(client_writer, eof_seq, &eof_pkt).await?;
            }
        }

        if prepare_ok.column_count > 0 && prepare_ok.with_metadata {
            for _ in 0..prepare_ok.column_count {
                let (meta_seq, meta_pkt) = async_packet_read!(backend.reader);
                self.copy_packet(client_writer, meta_seq, &meta_pkt).await?;
            }
            if !backend_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                let (eof_seq, eof_pkt) = async_packet_read!(backend.reader);
                self.copy_packet(client_writer, eof_seq, &eof_pkt).await?;
            }
        }

        client_writer.flush_all().await?;

        debug!(
            "prepared statement {} with {} params",
            prepare_ok.statement_id,
            params.len()
        );
        ctx.stmt_metadata.insert(prepare_ok.statement_id, params);
        backend.tracker.note_prepared_statement_opened();
        Ok(())
    }
}
