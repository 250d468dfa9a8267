use crate::backend::conn::BackendConn;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{ComForwarder, ForwardContext};

use async_trait::async_trait;
use std::io::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// COM_RESET_CONNECTION wipes all session state server-side; mirror it in
/// the tracker and drop the prepared-statement metadata.
pub struct ResetConnForwarder;

#[async_trait]
impl<R, W> ComForwarder<R, W> for ResetConnForwarder
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
        <ResetConnForwarder as ComForwarder<R, W>>::write_to_backend(self, backend, client_packet)
            .await?;
        let response = <ResetConnForwarder as ComForwarder<R, W>>::forward_one_packet(
            self,
            client_writer,
            backend,
            true,
        )
        .await?;

        if response.is_ok_packet() {
            debug!("backend {} session reset", backend.endpoint());
            backend.tracker.reset();
            ctx.stmt_metadata.clear();
        }
        Ok(())
    }
}
