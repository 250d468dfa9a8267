use crate::protocol::mysql::charset::DEFAULT_COLLATION_ID;
use crate::protocol::mysql::codec::server::{AuthMethodSwitch, Error as ErrPacket, Greeting, Ok as OkPacket};
use crate::protocol::mysql::codec::{CodecError, MessageEncode};
use crate::protocol::mysql::constants::{AuthPluginName, CommandCode, SCRAMBLE_SIZE};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::borrow::Cow;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

pub(crate) fn codec_to_io(err: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encode `msg` under `caps` and frame it as one packet.
pub async fn write_message<W, M>(
    w: &mut PacketWriter<W>,
    msg: &M,
    caps: CapabilityFlags,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: MessageEncode,
{
    let bytes = msg.encode_to_vec(caps).map_err(codec_to_io)?;
    w.write_all(&bytes)?;
    w.end_packet().await
}

/// Router-originated error packet toward the client.
pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    let packet = ErrPacket {
        error_code: err as u16,
        sql_state: Cow::Borrowed(&err.sqlstate()[..]),
        message: Cow::Borrowed(msg),
    };
    write_message(w, &packet, CapabilityFlags::CLIENT_PROTOCOL_41).await?;
    w.flush_all().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    caps: CapabilityFlags,
    ok_packet: &OkPacket<'_>,
) -> io::Result<()> {
    write_message(w, ok_packet, caps).await
}

/// Plain OK with the autocommit status most replies carry.
pub async fn write_simple_ok<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    caps: CapabilityFlags,
) -> io::Result<()> {
    let ok = OkPacket {
        status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        ..OkPacket::default()
    };
    write_ok_packet(w, caps, &ok).await?;
    w.flush_all().await
}

/// Initial server greeting toward a connecting client.
///
/// `server_capabilities` must already reflect whether TLS is on offer.
pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u64,
    scramble: [u8; SCRAMBLE_SIZE],
    server_version: &[u8],
    server_capabilities: CapabilityFlags,
) -> io::Result<()> {
    // the scramble goes out with its trailing NUL, like the server sends it
    let mut auth_data = scramble.to_vec();
    auth_data.push(0);
    let greeting = Greeting {
        protocol_version: 10,
        version: Cow::Borrowed(server_version),
        connection_id: conn_id as u32,
        auth_method_data: Cow::Owned(auth_data),
        capabilities: server_capabilities,
        collation: DEFAULT_COLLATION_ID,
        status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        auth_method_name: Cow::Borrowed(AuthPluginName::AuthNativePassword.as_ref().as_bytes()),
    };
    write_message(writer, &greeting, server_capabilities).await?;
    writer.flush_all().await
}

/// Ask the peer to redo authentication with `plugin` against `scramble`.
pub async fn write_auth_switch<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    plugin: AuthPluginName,
    scramble: &[u8],
) -> io::Result<()> {
    let mut auth_data = scramble.to_vec();
    auth_data.push(0);
    let switch = AuthMethodSwitch {
        auth_method: Cow::Borrowed(plugin.as_ref().as_bytes()),
        auth_method_data: Cow::Owned(auth_data),
    };
    write_message(w, &switch, CapabilityFlags::CLIENT_PLUGIN_AUTH).await?;
    w.flush_all().await
}

pub async fn write_command_byte<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    com: CommandCode,
) -> io::Result<()> {
    w.reset_seq();
    w.write_all(&[com as u8])?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_query_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    statement: &[u8],
) -> io::Result<()> {
    w.reset_seq();
    w.write_all(&[CommandCode::ComQuery as u8])?;
    w.write_all(statement)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_init_schema<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    schema: &[u8],
) -> io::Result<()> {
    w.reset_seq();
    w.write_all(&[CommandCode::ComInitDB as u8])?;
    w.write_all(schema)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_reset_connection<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    write_command_byte(w, CommandCode::ComResetConnection).await
}

pub async fn write_quit<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    write_command_byte(w, CommandCode::ComQuit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::codec::server::Error as ErrPacket;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;

    #[tokio::test]
    async fn err_packet_shape() {
        let mut out = Vec::new();
        {
            let mut w = PacketWriter::new(&mut out);
            write_err_packet(ErrorKind::ER_PARSE_ERROR, b"syntax", &mut w)
                .await
                .unwrap();
        }
        let mut reader = PacketReader::new(std::io::Cursor::new(out));
        let (_, pkt) = reader.next_read().unwrap().unwrap();
        assert!(pkt.is_err_packet());
        let (_, err) =
            ErrPacket::decode(&pkt, CapabilityFlags::CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, 1064);
        assert_eq!(err.sql_state.as_ref(), b"42000");
        assert_eq!(err.message.as_ref(), b"syntax");
    }

    #[tokio::test]
    async fn initial_handshake_decodes_as_greeting() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let mut out = Vec::new();
        {
            let mut w = PacketWriter::new(&mut out);
            write_initial_handshake(&mut w, 7, [b'x'; SCRAMBLE_SIZE], b"8.0.36-router", caps)
                .await
                .unwrap();
        }
        let mut reader = PacketReader::new(std::io::Cursor::new(out));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 0);
        let (_, greeting) = Greeting::decode(&pkt, caps).unwrap();
        assert_eq!(greeting.connection_id, 7);
        assert_eq!(greeting.version.as_ref(), b"8.0.36-router");
        assert_eq!(greeting.auth_method_data.len(), SCRAMBLE_SIZE + 1);
    }
}
