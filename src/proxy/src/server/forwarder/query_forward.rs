use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::protocol::mysql::codec::server::{ColumnCount, Eof, Ok as OkPacket, Row};
use crate::protocol::mysql::codec::MessageEncode;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::codec_to_io;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{ComForwarder, ForwardContext};
use crate::server::trace::TRACE_WARNING_CODE;

use async_trait::async_trait;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::borrow::Cow;
use std::io::{Error, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Streams a command's resultset(s) from the backend to the client.
///
/// Terminal OK/EOF packets are decoded, fed into the session tracker, and
/// re-encoded under the client's capabilities; everything else is copied
/// as-is. A sequence offset tracks rows the router injects.
pub struct QueryForwarder {
    pub com_code: CommandCode,
}

struct ResponseState {
    /// rows the router injected ahead of the terminal packet
    seq_offset: u8,
}

impl QueryForwarder {
    async fn copy_raw<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        seq: u8,
        state: &ResponseState,
        pkt: &Packet,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        client_writer.set_seq(seq.wrapping_add(state.seq_offset));
        client_writer.write_all(pkt)?;
        client_writer.end_packet().await?;
        Ok(())
    }

    /// Re-encode a terminal OK/EOF under the client's capabilities, with
    /// the trace-note warning folded into the count.
    #[allow(clippy::too_many_arguments)]
    async fn send_terminal<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        seq: u8,
        state: &ResponseState,
        ctx: &ForwardContext,
        ok: &OkPacket<'_>,
        eof_header: bool,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let warning_count = ok.warning_count.saturating_add(ctx.warning_bump());

        let bytes = if eof_header {
            let eof = Eof {
                affected_rows: ok.affected_rows,
                last_insert_id: ok.last_insert_id,
                status_flags: ok.status_flags,
                warning_count,
                message: Cow::Borrowed(&ok.message),
                session_changes: Cow::Borrowed(&ok.session_changes),
            };
            eof.encode_to_vec(ctx.client_caps).map_err(codec_to_io)?
        } else {
            let ok = OkPacket {
                affected_rows: ok.affected_rows,
                last_insert_id: ok.last_insert_id,
                status_flags: ok.status_flags,
                warning_count,
                message: Cow::Borrowed(&ok.message),
                session_changes: Cow::Borrowed(&ok.session_changes),
            };
            ok.encode_to_vec(ctx.client_caps).map_err(codec_to_io)?
        };

        client_writer.set_seq(seq.wrapping_add(state.seq_offset));
        client_writer.write_all(&bytes)?;
        client_writer.end_packet().await?;
        Ok(())
    }

    /// The trace note SHOW WARNINGS returns as its final row.
    async fn inject_trace_row<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        seq: u8,
        state: &mut ResponseState,
        ctx: &ForwardContext,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let Some(trace_json) = ctx.last_trace_json.as_deref() else {
            return Ok(());
        };
        let code = TRACE_WARNING_CODE.to_string();
        let row = Row {
            fields: vec![
                Some(Cow::Borrowed(b"Note")),
                Some(Cow::Borrowed(code.as_bytes())),
                Some(Cow::Borrowed(trace_json.as_bytes())),
            ],
        };
        let bytes = row.encode_to_vec(ctx.client_caps).map_err(codec_to_io)?;
        client_writer.set_seq(seq.wrapping_add(state.seq_offset));
        client_writer.write_all(&bytes)?;
        client_writer.end_packet().await?;
        state.seq_offset = state.seq_offset.wrapping_add(1);
        Ok(())
    }

    /// LOAD DATA LOCAL INFILE: the client uploads the file as packets
    /// terminated by an empty one.
    async fn relay_file_upload<R>(
        &self,
        client_reader: &mut PacketReader<R>,
        backend: &mut BackendConn,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let (seq, chunk) = async_packet_read!(client_reader);
            backend.writer.set_seq(seq);
            backend.writer.write_all(&chunk)?;
            backend.writer.end_packet().await?;
            backend.writer.flush_all().await?;
            if chunk.is_empty() {
                return Ok(());
            }
        }
    }

    /// Forward one statement's response, resultset by resultset.
    async fn forward_response<R, W>(
        &self,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        ctx: &mut ForwardContext,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let backend_caps = backend.capabilities();
        let mut state = ResponseState { seq_offset: 0 };

        loop {
            let (seq, pkt) = async_packet_read!(backend.reader);

            if pkt.is_err_packet() {
                if let Some(trace) = ctx.trace.as_mut() {
                    trace.set_failed();
                }
                self.copy_raw(client_writer, seq, &state, &pkt).await?;
                client_writer.flush_all().await?;
                return Ok(());
            }

            if pkt.is_ok_packet() {
                let (_, ok) =
                    OkPacket::decode(&pkt, backend_caps).map_err(codec_to_io)?;
                let _ = backend.tracker.observe_ok(&ok);
                let more = ok
                    .status_flags
                    .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
                self.send_terminal(client_writer, seq, &state, ctx, &ok, false)
                    .await?;
                if more {
                    continue;
                }
                client_writer.flush_all().await?;
                return Ok(());
            }

            if pkt.is_local_in_file_packet() {
                self.copy_raw(client_writer, seq, &state, &pkt).await?;
                client_writer.flush_all().await?;
                self.relay_file_upload(client_reader, backend).await?;
                continue;
            }

            // a resultset: column count, definitions, rows
            let (_, column_count) =
                ColumnCount::decode(&pkt, backend_caps).map_err(codec_to_io)?;
            self.copy_raw(client_writer, seq, &state, &pkt).await?;

            let mut last_seq = seq;
            for _ in 0..column_count.count {
                let (meta_seq, meta) = async_packet_read!(backend.reader);
                last_seq = meta_seq;
                self.copy_raw(client_writer, meta_seq, &state, &meta).await?;
            }

            // the definition/row separator exists only without
            // DEPRECATE_EOF; convert between dialects when they differ.
            if !backend_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                let (sep_seq, separator) = async_packet_read!(backend.reader);
                if !ctx
                    .client_caps
                    .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
                {
                    self.copy_raw(client_writer, sep_seq, &state, &separator)
                        .await?;
                } else {
                    // the client does not expect the separator
                    state.seq_offset = state.seq_offset.wrapping_sub(1);
                }
            } else if !ctx
                .client_caps
                .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
            {
                // synthesize the separator old clients expect; it takes
                // the next sequence-id slot.
                let bytes = Eof::default()
                    .encode_to_vec(ctx.client_caps)
                    .map_err(codec_to_io)?;
                client_writer
                    .set_seq(last_seq.wrapping_add(state.seq_offset).wrapping_add(1));
                client_writer.write_all(&bytes)?;
                client_writer.end_packet().await?;
                state.seq_offset = state.seq_offset.wrapping_add(1);
            }

            // rows until the terminal packet
            loop {
                let (row_seq, row_pkt) = async_packet_read!(backend.reader);
                if let Some(done) = self
                    .handle_row_phase_packet(
                        client_writer,
                        backend,
                        ctx,
                        &mut state,
                        row_seq,
                        row_pkt,
                    )
                    .await?
                {
                    if done {
                        return Ok(());
                    }
                    break;
                }
            }
        }
    }

    /// Process one packet of the row phase.
    ///
    /// `Ok(None)`: an ordinary row, keep reading. `Ok(Some(false))`: the
    /// resultset ended and more follow. `Ok(Some(true))`: the response is
    /// complete.
    async fn handle_row_phase_packet<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        ctx: &mut ForwardContext,
        state: &mut ResponseState,
        seq: u8,
        pkt: Packet,
    ) -> Result<Option<bool>, Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let backend_caps = backend.capabilities();

        if pkt.is_err_packet() {
            if let Some(trace) = ctx.trace.as_mut() {
                trace.set_failed();
            }
            self.copy_raw(client_writer, seq, state, &pkt).await?;
            client_writer.flush_all().await?;
            return Ok(Some(true));
        }

        let terminal = if backend_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            pkt.is_result_set_eof_packet()
        } else {
            pkt.is_eof_packet()
        };

        if !terminal {
            self.copy_raw(client_writer, seq, state, &pkt).await?;
            return Ok(None);
        }

        let (_, eof) = Eof::decode(&pkt, backend_caps).map_err(codec_to_io)?;
        let ok = OkPacket {
            affected_rows: eof.affected_rows,
            last_insert_id: eof.last_insert_id,
            status_flags: eof.status_flags,
            warning_count: eof.warning_count,
            message: Cow::Borrowed(&eof.message),
            session_changes: Cow::Borrowed(&eof.session_changes),
        };
        let _ = backend.tracker.observe_ok(&ok);

        if eof
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS)
        {
            backend.tracker.note_cursor_opened();
        }
        if eof
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_LAST_ROW_SENT)
        {
            backend.tracker.note_cursor_closed();
        }

        if ctx.forwarding_show_warnings {
            self.inject_trace_row(client_writer, seq, state, ctx).await?;
        }

        // the row phase always terminates with an 0xfe-headed packet on
        // the client side: a legacy EOF or an OK wearing the EOF header.
        self.send_terminal(client_writer, seq, state, ctx, &ok, true)
            .await?;

        let more = eof
            .status_flags
            .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
        if more {
            debug!("more resultsets follow");
            return Ok(Some(false));
        }
        client_writer.flush_all().await?;
        Ok(Some(true))
    }

    /// COM_FIELD_LIST and COM_STMT_FETCH have no leading column count;
    /// they stream packets straight to a terminal EOF.
    async fn forward_until_eof<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        ctx: &mut ForwardContext,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut state = ResponseState { seq_offset: 0 };
        loop {
            let (seq, pkt) = async_packet_read!(backend.reader);
            if let Some(done) = self
                .handle_row_phase_packet(client_writer, backend, ctx, &mut state, seq, pkt)
                .await?
            {
                if done {
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl<R, W> ComForwarder<R, W> for QueryForwarder
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        backend: &mut BackendConn,
        client_packet: &Packet,
        ctx: &mut ForwardContext,
    ) -> Result<(), Error> {
        <QueryForwarder as ComForwarder<R, W>>::write_to_backend(self, backend, client_packet)
            .await?;

        match self.com_code {
            CommandCode::ComQuery
            | CommandCode::ComStmtExecute
            | CommandCode::ComProcessInfo => {
                self.forward_response(client_reader, client_writer, backend, ctx)
                    .await
            }
            CommandCode::ComFieldList | CommandCode::ComStmtFetch => {
                self.forward_until_eof(client_writer, backend, ctx).await
            }
            other => Err(Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("QueryForwarder cannot forward {other:?}"),
            )),
        }
    }
}
