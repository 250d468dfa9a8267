use crate::async_packet_read;
use crate::backend::conn::BackendConn;
use crate::protocol::mysql::codec::client as client_msg;
use crate::protocol::mysql::codec::server as server_msg;
use crate::protocol::mysql::codec::MessageEncode;
use crate::protocol::mysql::constants::AuthPluginName;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::{scramble_response, CredentialCache, Credentials};
use crate::server::default_capabilities;
use crate::tls::ServerSslMode;

use mysql_common::constants::CapabilityFlags;
use std::borrow::Cow;
use std::io::{self, Error, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// caching_sha2 sub-status bytes inside server AuthMethodData.
const FAST_AUTH_DONE: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;
/// Client's request for the server's RSA public key.
const REQUEST_PUBLIC_KEY: u8 = 0x02;

fn permission_denied(message: impl Into<String>) -> Error {
    Error::new(io::ErrorKind::PermissionDenied, message.into())
}

/// Read the server greeting off a fresh backend connection and remember
/// what it told us. Returns the greeting's sequence-id and scramble.
async fn read_server_greeting(
    backend: &mut BackendConn,
) -> io::Result<(u8, Vec<u8>, CapabilityFlags, Vec<u8>)> {
    let (seq, greeting_pkt) = async_packet_read!(backend.reader);
    let (_, greeting) = server_msg::Greeting::decode(&greeting_pkt, CapabilityFlags::empty())
        .map_err(writers::codec_to_io)?;

    let server_caps = greeting.capabilities;
    let shared = default_capabilities() & server_caps;

    backend.set_capabilities(shared);
    backend.set_server_version(greeting.version.to_vec());
    backend.set_connection_id(greeting.connection_id);

    // strip the trailing NUL servers append to the scramble
    let mut scramble = greeting.auth_method_data.to_vec();
    if scramble.last() == Some(&0) {
        scramble.pop();
    }

    Ok((seq, scramble, server_caps, greeting.auth_method_name.to_vec()))
}

/// Whether the resolved mode asks for TLS toward this server.
fn backend_wants_tls(
    server_caps: CapabilityFlags,
    resolved_mode: ServerSslMode,
) -> io::Result<bool> {
    let server_offers_tls = server_caps.contains(CapabilityFlags::CLIENT_SSL);
    match resolved_mode {
        ServerSslMode::Disabled => Ok(false),
        ServerSslMode::Preferred => Ok(server_offers_tls),
        ServerSslMode::Required => {
            if !server_offers_tls {
                return Err(permission_denied("server does not support TLS"));
            }
            Ok(true)
        }
        // resolved before connecting; behave like PREFERRED if it leaks
        ServerSslMode::AsClient => Ok(server_offers_tls),
    }
}

/// Negotiate TLS toward the backend when the mode asks for it.
///
/// Sends the short pre-TLS greeting, then swaps the socket for the TLS
/// stream. `greeting_seq` is the sequence-id of the server greeting.
#[cfg(feature = "tls")]
async fn maybe_upgrade_backend_tls(
    mut backend: BackendConn,
    server_caps: CapabilityFlags,
    resolved_mode: ServerSslMode,
    greeting_seq: u8,
) -> io::Result<(BackendConn, CapabilityFlags)> {
    let mut shared = backend.capabilities();
    if !backend_wants_tls(server_caps, resolved_mode)? {
        return Ok((backend, shared));
    }

    shared |= CapabilityFlags::CLIENT_SSL;
    backend.set_capabilities(shared);

    let ssl_request = client_msg::Greeting {
        capabilities: shared,
        max_packet_size: 1 << 24,
        collation: crate::protocol::mysql::charset::DEFAULT_COLLATION_ID,
        ..client_msg::Greeting::default()
    };
    backend.writer.set_seq(greeting_seq.wrapping_add(1));
    let bytes = ssl_request
        .encode_to_vec(shared)
        .map_err(writers::codec_to_io)?;
    backend.writer.write_all(&bytes)?;
    backend.writer.end_packet().await?;
    backend.writer.flush_all().await?;

    let connector = crate::tls::backend_tls_connector();
    let domain = crate::tls::server_name_for(backend.endpoint());
    let backend = backend.upgrade_to_tls(connector, domain).await?;
    Ok((backend, shared))
}

#[cfg(not(feature = "tls"))]
async fn maybe_upgrade_backend_tls(
    backend: BackendConn,
    server_caps: CapabilityFlags,
    resolved_mode: ServerSslMode,
    _greeting_seq: u8,
) -> io::Result<(BackendConn, CapabilityFlags)> {
    let shared = backend.capabilities();
    if backend_wants_tls(server_caps, resolved_mode)? {
        return Err(permission_denied("router built without tls support"));
    }
    Ok((backend, shared))
}

pub struct ProxyAuthenticator;

impl ProxyAuthenticator {
    /// Pair a fresh backend with a connecting client: relay the
    /// authentication exchange between them, forcing an auth-method switch
    /// so the client answers the backend's scramble.
    ///
    /// Opportunistically caches cleartext credentials the exchange
    /// reveals, keyed by username, for the reconnect path.
    #[allow(clippy::too_many_arguments)]
    pub async fn pair_client_with_backend<R, W>(
        &self,
        backend: BackendConn,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        client_greeting: &client_msg::Greeting<'static>,
        client_greeting_seq: u8,
        client_channel_is_secure: bool,
        server_ssl_mode: ServerSslMode,
        cache: &CredentialCache,
    ) -> io::Result<BackendConn>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut backend = backend;
        let (greeting_seq, _scramble, server_caps, _server_plugin) =
            read_server_greeting(&mut backend).await?;

        let (mut backend, shared) =
            maybe_upgrade_backend_tls(backend, server_caps, server_ssl_mode, greeting_seq)
                .await?;

        let username = String::from_utf8_lossy(&client_greeting.username).into_owned();

        // forward the client's greeting with an unknown auth plugin; the
        // backend answers with an auth-method switch carrying its own
        // scramble, which the client can actually answer.
        let forwarded = client_msg::Greeting {
            capabilities: shared,
            max_packet_size: client_greeting.max_packet_size,
            collation: client_greeting.collation,
            username: Cow::Owned(client_greeting.username.to_vec()),
            auth_method_data: Cow::Borrowed(&[]),
            schema: Cow::Owned(client_greeting.schema.to_vec()),
            auth_method_name: Cow::Borrowed(
                AuthPluginName::UnKnowPluginName.as_ref().as_bytes(),
            ),
            attributes: Cow::Owned(client_greeting.attributes.to_vec()),
        };
        let caps_for_encode = forwarded.capabilities;
        if backend.is_tls() {
            backend.writer.set_seq(greeting_seq.wrapping_add(2));
        } else {
            backend.writer.set_seq(greeting_seq.wrapping_add(1));
        }
        let bytes = forwarded
            .encode_to_vec(caps_for_encode)
            .map_err(writers::codec_to_io)?;
        backend.writer.write_all(&bytes)?;
        backend.writer.end_packet().await?;
        backend.writer.flush_all().await?;

        self.relay_auth_exchange(
            &mut backend,
            client_reader,
            client_writer,
            client_greeting_seq,
            &username,
            client_channel_is_secure,
            cache,
        )
        .await?;

        cache_login(cache, &username, client_greeting);
        backend.set_auth_username(username);
        Ok(backend)
    }

    /// Relay auth packets between backend and client until OK or Error,
    /// snooping cleartext passwords the sha2 full-auth path reveals.
    async fn relay_auth_exchange<R, W>(
        &self,
        backend: &mut BackendConn,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        client_seq: u8,
        username: &str,
        client_channel_is_secure: bool,
        cache: &CredentialCache,
    ) -> io::Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        // sequence-id the next router→client packet has to carry
        let mut next_out_seq = client_seq.wrapping_add(1);
        let mut awaiting_cleartext = false;

        loop {
            let (be_seq, pkt) = async_packet_read!(backend.reader);

            client_writer.set_seq(next_out_seq);
            client_writer.write_all(&pkt)?;
            client_writer.end_packet().await?;
            client_writer.flush_all().await?;
            next_out_seq = next_out_seq.wrapping_add(1);

            if pkt.is_ok_packet() {
                debug!("backend auth complete for {username:?}");
                return Ok(());
            }

            if pkt.is_err_packet() {
                let (_, err) = server_msg::Error::decode(&pkt, backend.capabilities())
                    .map_err(writers::codec_to_io)?;
                warn!(
                    "backend rejected auth for {username:?}: {}",
                    String::from_utf8_lossy(&err.message)
                );
                return Err(permission_denied("backend rejected authentication"));
            }

            if pkt.is_auth_more_data_packet() {
                awaiting_cleartext = pkt.get(1) == Some(&PERFORM_FULL_AUTH);
                if pkt.get(1) == Some(&FAST_AUTH_DONE) {
                    // fast-auth success; the OK follows without any client
                    // involvement
                    continue;
                }
            }

            // auth-method switch or extra auth data: the client answers
            let (c_seq, reply) = async_packet_read!(client_reader);
            next_out_seq = c_seq.wrapping_add(1);

            if awaiting_cleartext
                && client_channel_is_secure
                && reply.last() == Some(&0)
                && reply.first() != Some(&REQUEST_PUBLIC_KEY)
            {
                cache.store_cleartext(username, &reply[..reply.len() - 1]);
            }

            backend.writer.set_seq(be_seq.wrapping_add(1));
            backend.writer.write_all(&reply)?;
            backend.writer.end_packet().await?;
            backend.writer.flush_all().await?;
        }
    }

    /// Authenticate a fresh backend from cached credentials only: the
    /// reconnect path, where no client exchange is possible.
    pub async fn authenticate_from_cache(
        &self,
        backend: BackendConn,
        creds: &Credentials,
        server_ssl_mode: ServerSslMode,
    ) -> io::Result<BackendConn> {
        let mut backend = backend;
        let (greeting_seq, scramble, server_caps, server_plugin) =
            read_server_greeting(&mut backend).await?;

        let (mut backend, shared) =
            maybe_upgrade_backend_tls(backend, server_caps, server_ssl_mode, greeting_seq)
                .await?;

        let password = creds.cleartext_password.as_deref().ok_or_else(|| {
            permission_denied("no cached credentials to replay authentication")
        })?;

        let plugin = AuthPluginName::from_bytes(&server_plugin);
        let auth_response = scramble_response(plugin, &scramble, password)
            .ok_or_else(|| permission_denied("unsupported server auth plugin"))?;

        let greeting = client_msg::Greeting {
            capabilities: shared,
            max_packet_size: 1 << 24,
            collation: crate::protocol::mysql::charset::DEFAULT_COLLATION_ID,
            username: Cow::Owned(creds.username.clone().into_bytes()),
            auth_method_data: Cow::Owned(auth_response),
            schema: Cow::Owned(
                creds
                    .schema
                    .clone()
                    .map(String::into_bytes)
                    .unwrap_or_default(),
            ),
            auth_method_name: Cow::Owned(server_plugin.clone()),
            attributes: Cow::Borrowed(&[]),
        };
        if backend.is_tls() {
            backend.writer.set_seq(greeting_seq.wrapping_add(2));
        } else {
            backend.writer.set_seq(greeting_seq.wrapping_add(1));
        }
        let bytes = greeting
            .encode_to_vec(shared)
            .map_err(writers::codec_to_io)?;
        backend.writer.write_all(&bytes)?;
        backend.writer.end_packet().await?;
        backend.writer.flush_all().await?;

        loop {
            let (be_seq, pkt) = async_packet_read!(backend.reader);

            if pkt.is_ok_packet() {
                backend.set_auth_username(creds.username.clone());
                return Ok(backend);
            }
            if pkt.is_err_packet() {
                let (_, err) = server_msg::Error::decode(&pkt, backend.capabilities())
                    .map_err(writers::codec_to_io)?;
                return Err(permission_denied(format!(
                    "replayed authentication failed: {} ({})",
                    String::from_utf8_lossy(&err.message),
                    err.error_code,
                )));
            }

            if pkt.is_auth_more_data_packet() {
                match pkt.get(1) {
                    Some(&FAST_AUTH_DONE) => continue,
                    Some(&PERFORM_FULL_AUTH) => {
                        if !backend.is_tls() && !backend.endpoint().starts_with('/') {
                            // without a secure channel the router has no
                            // way to hand over the password; surface the
                            // server's own refusal instead of hanging.
                            return Err(permission_denied(
                                "authentication requires a secure connection",
                            ));
                        }
                        let mut cleartext = password.to_vec();
                        cleartext.push(0);
                        backend.writer.set_seq(be_seq.wrapping_add(1));
                        backend.writer.write_all(&cleartext)?;
                        backend.writer.end_packet().await?;
                        backend.writer.flush_all().await?;
                        continue;
                    }
                    _ => {
                        return Err(permission_denied("unexpected auth data from server"));
                    }
                }
            }

            if pkt.is_auth_switch_packet() {
                let (_, switch) =
                    server_msg::AuthMethodSwitch::decode(&pkt, backend.capabilities())
                        .map_err(writers::codec_to_io)?;
                let mut new_scramble = switch.auth_method_data.to_vec();
                if new_scramble.last() == Some(&0) {
                    new_scramble.pop();
                }
                let plugin = AuthPluginName::from_bytes(&switch.auth_method);
                let response = scramble_response(plugin, &new_scramble, password)
                    .ok_or_else(|| permission_denied("unsupported auth plugin on switch"))?;
                backend.writer.set_seq(be_seq.wrapping_add(1));
                backend.writer.write_all(&response)?;
                backend.writer.end_packet().await?;
                backend.writer.flush_all().await?;
                continue;
            }

            return Err(permission_denied("unexpected packet during auth replay"));
        }
    }

    /// Re-target an already-authenticated pooled session at `creds` via
    /// COM_CHANGE_USER. Used when a session changes hands between clients
    /// of different accounts.
    pub async fn change_user_from_cache(
        &self,
        backend: &mut BackendConn,
        creds: &Credentials,
    ) -> io::Result<()> {
        let password = creds.cleartext_password.as_deref().ok_or_else(|| {
            permission_denied("no cached credentials for change-user")
        })?;

        let change_user = client_msg::ChangeUser {
            username: Cow::Owned(creds.username.clone().into_bytes()),
            auth_method_data: Cow::Borrowed(&[]),
            schema: Cow::Owned(
                creds
                    .schema
                    .clone()
                    .map(String::into_bytes)
                    .unwrap_or_default(),
            ),
            collation: crate::protocol::mysql::charset::UTF8_MB4_GENERAL_CI,
            auth_method_name: Cow::Borrowed(
                AuthPluginName::UnKnowPluginName.as_ref().as_bytes(),
            ),
            attributes: Cow::Borrowed(&[]),
        };
        backend.reset_seq();
        let bytes = change_user
            .encode_to_vec(backend.capabilities())
            .map_err(writers::codec_to_io)?;
        backend.writer.write_all(&bytes)?;
        backend.writer.end_packet().await?;
        backend.writer.flush_all().await?;

        loop {
            let (be_seq, pkt) = async_packet_read!(backend.reader);
            if pkt.is_ok_packet() {
                backend.set_auth_username(creds.username.clone());
                backend.tracker.reset();
                return Ok(());
            }
            if pkt.is_err_packet() {
                return Err(permission_denied("change-user rejected"));
            }
            if pkt.is_auth_switch_packet() {
                let (_, switch) =
                    server_msg::AuthMethodSwitch::decode(&pkt, backend.capabilities())
                        .map_err(writers::codec_to_io)?;
                let mut scramble = switch.auth_method_data.to_vec();
                if scramble.last() == Some(&0) {
                    scramble.pop();
                }
                let plugin = AuthPluginName::from_bytes(&switch.auth_method);
                let response = scramble_response(plugin, &scramble, password)
                    .ok_or_else(|| permission_denied("unsupported auth plugin on switch"))?;
                backend.writer.set_seq(be_seq.wrapping_add(1));
                backend.writer.write_all(&response)?;
                backend.writer.end_packet().await?;
                backend.writer.flush_all().await?;
                continue;
            }
            if pkt.is_auth_more_data_packet() {
                match pkt.get(1) {
                    Some(&FAST_AUTH_DONE) => continue,
                    Some(&PERFORM_FULL_AUTH) if backend.is_tls() => {
                        let mut cleartext = password.to_vec();
                        cleartext.push(0);
                        backend.writer.set_seq(be_seq.wrapping_add(1));
                        backend.writer.write_all(&cleartext)?;
                        backend.writer.end_packet().await?;
                        backend.writer.flush_all().await?;
                        continue;
                    }
                    _ => {
                        return Err(permission_denied(
                            "authentication requires a secure connection",
                        ))
                    }
                }
            }
            return Err(permission_denied("unexpected packet during change-user"));
        }
    }

    /// Write the access-denied the client sees when the router cannot
    /// complete authentication on its behalf.
    pub async fn reject_client<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        username: &str,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let message = format!("Access denied for user '{username}'");
        writers::write_err_packet(
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            message.as_bytes(),
            client_writer,
        )
        .await
    }
}

fn cache_login(
    cache: &CredentialCache,
    username: &str,
    client_greeting: &client_msg::Greeting<'static>,
) {
    let mut creds = cache.get(username).unwrap_or_else(|| Credentials {
        username: username.to_string(),
        ..Credentials::default()
    });
    creds.schema = if client_greeting.schema.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&client_greeting.schema).into_owned())
    };
    creds.auth_method = Some(AuthPluginName::from_bytes(
        &client_greeting.auth_method_name,
    ));
    cache.store(creds);
}
