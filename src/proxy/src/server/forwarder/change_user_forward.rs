use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::protocol::mysql::codec::client::ChangeUser;
use crate::protocol::mysql::codec::MessageEncode;
use crate::protocol::mysql::constants::AuthPluginName;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::codec_to_io;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{ComForwarder, ForwardContext};

use async_trait::async_trait;
use std::borrow::Cow;
use std::io::{Error, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// COM_CHANGE_USER.
///
/// The client's auth response answers the router's scramble, not the
/// backend's, so the command goes out with an unknown auth plugin and the
/// resulting auth-method switch is relayed back to the client.
pub struct ChangeUserForwarder;

#[async_trait]
impl<R, W> ComForwarder<R, W> for ChangeUserForwarder
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
        let backend_caps = backend.capabilities();
        let (_, change_user) =
            ChangeUser::decode(client_packet, ctx.client_caps).map_err(codec_to_io)?;

        let rewritten = ChangeUser {
            username: Cow::Owned(change_user.username.to_vec()),
            auth_method_data: Cow::Borrowed(&[]),
            schema: Cow::Owned(change_user.schema.to_vec()),
            collation: change_user.collation,
            auth_method_name: Cow::Borrowed(
                AuthPluginName::UnKnowPluginName.as_ref().as_bytes(),
            ),
            attributes: Cow::Owned(change_user.attributes.to_vec()),
        };
        let username = String::from_utf8_lossy(&change_user.username).into_owned();

        backend.reset_seq();
        let bytes = rewritten
            .encode_to_vec(backend_caps)
            .map_err(codec_to_io)?;
        backend.writer.write_all(&bytes)?;
        backend.writer.end_packet().await?;
        backend.writer.flush_all().await?;

        // relay the auth exchange until OK or Error
        let mut client_seq = 0u8;
        loop {
            let (be_seq, pkt) = async_packet_read!(backend.reader);

            if pkt.is_ok_packet() || pkt.is_err_packet() {
                client_writer.set_seq(client_seq.wrapping_add(1));
                client_writer.write_all(&pkt)?;
                client_writer.end_packet().await?;
                client_writer.flush_all().await?;

                if pkt.is_ok_packet() {
                    debug!("change-user to {username:?} on {}", backend.endpoint());
                    backend.set_auth_username(username);
                    backend.tracker.reset();
                    ctx.stmt_metadata.clear();
                }
                return Ok(());
            }

            // auth-switch or extra auth data: the client answers
            client_writer.set_seq(client_seq.wrapping_add(1));
            client_writer.write_all(&pkt)?;
            client_writer.end_packet().await?;
            client_writer.flush_all().await?;

            let (c_seq, reply) = async_packet_read!(client_reader);
            client_seq = c_seq;

            backend.writer.set_seq(be_seq.wrapping_add(1));
            backend.writer.write_all(&reply)?;
            backend.writer.end_packet().await?;
            backend.writer.flush_all().await?;
        }
    }
}
