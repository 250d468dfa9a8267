//! Server-side messages of the classic protocol.
//!
//! Every message decodes from a frame payload (header already stripped) and
//! encodes the exact byte sequence back under the same shared capabilities.

use crate::protocol::mysql::codec::{
    bytes_per_bits, put_binary_field, take_binary_field, CodecError, CodecResult, DecodeBuf,
    EncodeBuf, MessageEncode,
};
use crate::protocol::mysql::constants::AUTH_PLUGIN_DATA_PART_1_LENGTH;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::borrow::Cow;

const GREETING_FILLER_LEN: usize = 10;
const PROTOCOL_V9: u8 = 0x09;
const PROTOCOL_V10: u8 = 0x0a;

/// Initial handshake packet the server sends on connect.
///
/// Protocol 10 is what everything since 3.22 speaks; protocol 9 and the
/// truncated 3.21 form (capabilities fit in two bytes, nothing follows)
/// still decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting<'a> {
    pub protocol_version: u8,
    pub version: Cow<'a, [u8]>,
    pub connection_id: u32,
    pub auth_method_data: Cow<'a, [u8]>,
    pub capabilities: CapabilityFlags,
    pub collation: u8,
    pub status_flags: StatusFlags,
    pub auth_method_name: Cow<'a, [u8]>,
}

impl<'a> Greeting<'a> {
    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);

        let protocol_version = dec.u8()?;
        if protocol_version != PROTOCOL_V9 && protocol_version != PROTOCOL_V10 {
            return Err(CodecError::InvalidInput);
        }

        let version = dec.nul_term_bytes()?;
        let connection_id = dec.u32_le()?;
        let auth_data_1 = dec.nul_term_bytes()?;

        if protocol_version == PROTOCOL_V9 {
            return Ok((
                dec.consumed(),
                Greeting {
                    protocol_version,
                    version: Cow::Borrowed(version),
                    connection_id,
                    auth_method_data: Cow::Borrowed(auth_data_1),
                    capabilities: CapabilityFlags::empty(),
                    collation: 0,
                    status_flags: StatusFlags::empty(),
                    auth_method_name: Cow::Borrowed(&[]),
                },
            ));
        }

        let cap_lower = dec.u16_le()?;

        // a 3.21 server stops here.
        if dec.is_empty() {
            return Ok((
                dec.consumed(),
                Greeting {
                    protocol_version,
                    version: Cow::Borrowed(version),
                    connection_id,
                    auth_method_data: Cow::Borrowed(auth_data_1),
                    capabilities: CapabilityFlags::from_bits_truncate(u32::from(cap_lower)),
                    collation: 0,
                    status_flags: StatusFlags::empty(),
                    auth_method_name: Cow::Borrowed(&[]),
                },
            ));
        }

        let collation = dec.u8()?;
        let status_flags = StatusFlags::from_bits_truncate(dec.u16_le()?);
        let cap_upper = dec.u16_le()?;
        let capabilities = CapabilityFlags::from_bits_truncate(
            u32::from(cap_lower) | (u32::from(cap_upper) << 16),
        );

        // should be 21, at least 8. the byte is filler when plugin_auth is
        // not set.
        let mut auth_data_2_len = 13usize;
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let announced = dec.u8()? as usize;
            if announced < 8 {
                return Err(CodecError::InvalidInput);
            }
            auth_data_2_len = announced - AUTH_PLUGIN_DATA_PART_1_LENGTH;
        } else {
            dec.skip(1)?;
        }

        dec.skip(GREETING_FILLER_LEN)?;

        let mut auth_method_data = auth_data_1.to_vec();
        let mut auth_method_name: &[u8] = &[];
        if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            auth_method_data.extend_from_slice(dec.take(auth_data_2_len)?);
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                auth_method_name = dec.nul_term_bytes()?;
            }
        }

        Ok((
            dec.consumed(),
            Greeting {
                protocol_version,
                version: Cow::Borrowed(version),
                connection_id,
                auth_method_data: Cow::Owned(auth_method_data),
                capabilities,
                collation,
                status_flags,
                auth_method_name: Cow::Borrowed(auth_method_name),
            },
        ))
    }

    pub fn into_owned(self) -> Greeting<'static> {
        Greeting {
            protocol_version: self.protocol_version,
            version: Cow::Owned(self.version.into_owned()),
            connection_id: self.connection_id,
            auth_method_data: Cow::Owned(self.auth_method_data.into_owned()),
            capabilities: self.capabilities,
            collation: self.collation,
            status_flags: self.status_flags,
            auth_method_name: Cow::Owned(self.auth_method_name.into_owned()),
        }
    }
}

impl MessageEncode for Greeting<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(self.protocol_version)?;
        buf.put_nul_term(&self.version)?;
        buf.put_u32_le(self.connection_id)?;

        let split = self.auth_method_data.len().min(AUTH_PLUGIN_DATA_PART_1_LENGTH);
        buf.put_nul_term(&self.auth_method_data[..split])?;

        if self.protocol_version == PROTOCOL_V9 {
            return Ok(());
        }

        let cap_bits = self.capabilities.bits();
        buf.put_u16_le((cap_bits & 0xffff) as u16)?;

        if cap_bits < (1 << 16) && self.status_flags.is_empty() && self.collation == 0 {
            // short 3.21-style greeting
            return Ok(());
        }

        buf.put_u8(self.collation)?;
        buf.put_u16_le(self.status_flags.bits())?;
        buf.put_u16_le((cap_bits >> 16) as u16)?;

        if self.capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            buf.put_u8(self.auth_method_data.len() as u8)?;
        } else {
            buf.put_u8(0)?;
        }
        buf.put_bytes(&[0u8; GREETING_FILLER_LEN])?;

        if self
            .capabilities
            .contains(CapabilityFlags::CLIENT_SECURE_CONNECTION)
        {
            buf.put_bytes(&self.auth_method_data[split..])?;
            if self.capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                buf.put_nul_term(&self.auth_method_name)?;
            }
        }

        Ok(())
    }
}

/// Auth-method-switch request (0xfe) sent mid-handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthMethodSwitch<'a> {
    pub auth_method: Cow<'a, [u8]>,
    pub auth_method_data: Cow<'a, [u8]>,
}

impl<'a> AuthMethodSwitch<'a> {
    pub const CMD_BYTE: u8 = 0xfe;

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        if !caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            // old-auth-switch for pre-plugin clients
            return Ok((dec.consumed(), AuthMethodSwitch::default()));
        }

        let auth_method = dec.nul_term_bytes()?;
        let auth_method_data = dec.take_rest();

        Ok((
            dec.consumed(),
            AuthMethodSwitch {
                auth_method: Cow::Borrowed(auth_method),
                auth_method_data: Cow::Borrowed(auth_method_data),
            },
        ))
    }
}

impl MessageEncode for AuthMethodSwitch<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            buf.put_nul_term(&self.auth_method)?;
            buf.put_bytes(&self.auth_method_data)?;
        }
        Ok(())
    }
}

/// Extra auth data from the server (0x01 header), e.g. the sha2 fast-auth
/// result or the RSA public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMethodData<'a> {
    pub auth_method_data: Cow<'a, [u8]>,
}

impl<'a> AuthMethodData<'a> {
    pub const CMD_BYTE: u8 = 0x01;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let auth_method_data = dec.take_rest();
        Ok((
            dec.consumed(),
            AuthMethodData {
                auth_method_data: Cow::Borrowed(auth_method_data),
            },
        ))
    }
}

impl MessageEncode for AuthMethodData<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_bytes(&self.auth_method_data)
    }
}

/// Server OK packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ok<'a> {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warning_count: u16,
    pub message: Cow<'a, [u8]>,
    pub session_changes: Cow<'a, [u8]>,
}

impl<'a> Ok<'a> {
    pub const CMD_BYTE: u8 = 0x00;

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        Self::decode_after_cmd_byte(dec, caps)
    }

    /// Shared tail of the OK packet, also used by the Eof packet when
    /// `text_result_with_session_tracking` turns it into an OK with an 0xfe
    /// header.
    fn decode_after_cmd_byte(
        mut dec: DecodeBuf<'a>,
        caps: CapabilityFlags,
    ) -> CodecResult<(usize, Self)> {
        let affected_rows = dec.var_int()?;
        let last_insert_id = dec.var_int()?;

        let mut status_flags = StatusFlags::empty();
        let mut warning_count = 0u16;
        if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41)
            || caps.contains(CapabilityFlags::CLIENT_TRANSACTIONS)
        {
            status_flags = StatusFlags::from_bits_retain(dec.u16_le()?);
            if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
                warning_count = dec.u16_le()?;
            }
        }

        let mut message: &[u8] = &[];
        let mut session_changes: &[u8] = &[];
        if caps.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            // the message is a var-string, but only present if there is
            // one. probe on a cursor copy so a missing message consumes
            // nothing.
            let mut probe = dec;
            if let Result::Ok(msg) = probe.var_bytes() {
                message = msg;
                dec = probe;
            }

            if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                session_changes = dec.var_bytes()?;
            }
        } else {
            message = dec.take_rest();
        }

        Ok((
            dec.consumed(),
            Ok {
                affected_rows,
                last_insert_id,
                status_flags,
                warning_count,
                message: Cow::Borrowed(message),
                session_changes: Cow::Borrowed(session_changes),
            },
        ))
    }

    pub fn into_owned(self) -> Ok<'static> {
        Ok {
            affected_rows: self.affected_rows,
            last_insert_id: self.last_insert_id,
            status_flags: self.status_flags,
            warning_count: self.warning_count,
            message: Cow::Owned(self.message.into_owned()),
            session_changes: Cow::Owned(self.session_changes.into_owned()),
        }
    }

    fn encode_after_cmd_byte(
        &self,
        buf: &mut EncodeBuf<'_>,
        caps: CapabilityFlags,
    ) -> CodecResult<()> {
        buf.put_var_int(self.affected_rows)?;
        buf.put_var_int(self.last_insert_id)?;

        if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41)
            || caps.contains(CapabilityFlags::CLIENT_TRANSACTIONS)
        {
            buf.put_u16_le(self.status_flags.bits())?;
            if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
                buf.put_u16_le(self.warning_count)?;
            }
        }

        if caps.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            buf.put_var_bytes(&self.message)?;
            if self
                .status_flags
                .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
            {
                buf.put_var_bytes(&self.session_changes)?;
            }
        } else {
            buf.put_bytes(&self.message)?;
        }

        Ok(())
    }
}

impl MessageEncode for Ok<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        self.encode_after_cmd_byte(buf, caps)
    }
}

/// Server EOF packet (0xfe).
///
/// Under `text_result_with_session_tracking` this is an OK packet with an
/// 0xfe header; under bare `protocol_41` it is the four-byte short form;
/// otherwise it is the header alone. The shape is picked from the shared
/// capabilities, never from the payload length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Eof<'a> {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warning_count: u16,
    pub message: Cow<'a, [u8]>,
    pub session_changes: Cow<'a, [u8]>,
}

impl<'a> Eof<'a> {
    pub const CMD_BYTE: u8 = 0xfe;

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        if caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            let (consumed, ok) = Ok::decode_after_cmd_byte(dec, caps)?;
            Ok((
                consumed,
                Eof {
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                    status_flags: ok.status_flags,
                    warning_count: ok.warning_count,
                    message: ok.message,
                    session_changes: ok.session_changes,
                },
            ))
        } else if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            let warning_count = dec.u16_le()?;
            let status_flags = StatusFlags::from_bits_retain(dec.u16_le()?);
            Ok((
                dec.consumed(),
                Eof {
                    warning_count,
                    status_flags,
                    ..Eof::default()
                },
            ))
        } else {
            Ok((dec.consumed(), Eof::default()))
        }
    }
}

impl MessageEncode for Eof<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;

        if caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            let ok = Ok {
                affected_rows: self.affected_rows,
                last_insert_id: self.last_insert_id,
                status_flags: self.status_flags,
                warning_count: self.warning_count,
                message: Cow::Borrowed(&self.message),
                session_changes: Cow::Borrowed(&self.session_changes),
            };
            ok.encode_after_cmd_byte(buf, caps)
        } else if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            buf.put_u16_le(self.warning_count)?;
            buf.put_u16_le(self.status_flags.bits())
        } else {
            Result::Ok(())
        }
    }
}

/// Server Error packet (0xff).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error<'a> {
    pub error_code: u16,
    pub sql_state: Cow<'a, [u8]>,
    pub message: Cow<'a, [u8]>,
}

impl<'a> Error<'a> {
    pub const CMD_BYTE: u8 = 0xff;

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let error_code = dec.u16_le()?;

        let sql_state: &[u8] = if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            if dec.u8()? != b'#' {
                return Err(CodecError::InvalidInput);
            }
            dec.take(5)?
        } else {
            &[]
        };

        let message = dec.take_rest();
        Ok((
            dec.consumed(),
            Error {
                error_code,
                sql_state: Cow::Borrowed(sql_state),
                message: Cow::Borrowed(message),
            },
        ))
    }

    pub fn into_owned(self) -> Error<'static> {
        Error {
            error_code: self.error_code,
            sql_state: Cow::Owned(self.sql_state.into_owned()),
            message: Cow::Owned(self.message.into_owned()),
        }
    }
}

impl MessageEncode for Error<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u16_le(self.error_code)?;
        if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            buf.put_u8(b'#')?;
            if self.sql_state.len() != 5 {
                return Err(CodecError::InvalidInput);
            }
            buf.put_bytes(&self.sql_state)?;
        }
        buf.put_bytes(&self.message)
    }
}

/// First packet of a text resultset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnCount {
    pub count: u64,
}

impl ColumnCount {
    pub fn decode(input: &[u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        let count = dec.var_int()?;
        Ok((dec.consumed(), ColumnCount { count }))
    }
}

impl MessageEncode for ColumnCount {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_var_int(self.count)
    }
}

/// Column definition.
///
/// The 4.1 form wraps the fixed fields into a var-string of length 12; the
/// 3.2x legacy form is still decoded for old backends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMeta<'a> {
    pub catalog: Cow<'a, [u8]>,
    pub schema: Cow<'a, [u8]>,
    pub table: Cow<'a, [u8]>,
    pub orig_table: Cow<'a, [u8]>,
    pub name: Cow<'a, [u8]>,
    pub orig_name: Cow<'a, [u8]>,
    pub collation: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl<'a> ColumnMeta<'a> {
    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);

        if !caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            // 3.2x protocol used up to 4.0.x
            let flags_size: usize = if caps.contains(CapabilityFlags::CLIENT_LONG_FLAG) {
                2
            } else {
                1
            };

            let table = dec.var_bytes()?;
            let name = dec.var_bytes()?;

            if dec.var_int()? != 3 {
                return Err(CodecError::InvalidInput);
            }
            let column_length = dec.u24_le()?;

            if dec.var_int()? != 1 {
                return Err(CodecError::InvalidInput);
            }
            let column_type = dec.u8()?;

            if dec.var_int()? != (flags_size + 1) as u64 {
                return Err(CodecError::InvalidInput);
            }
            let flags_and_decimals = dec.fixed_int(flags_size + 1)?;
            let flags = (flags_and_decimals & ((1 << (flags_size * 8)) - 1)) as u16;
            let decimals = (flags_and_decimals >> (flags_size * 8)) as u8;

            return Ok((
                dec.consumed(),
                ColumnMeta {
                    table: Cow::Borrowed(table),
                    name: Cow::Borrowed(name),
                    column_length,
                    column_type,
                    flags,
                    decimals,
                    ..ColumnMeta::default()
                },
            ));
        }

        let catalog = dec.var_bytes()?;
        let schema = dec.var_bytes()?;
        let table = dec.var_bytes()?;
        let orig_table = dec.var_bytes()?;
        let name = dec.var_bytes()?;
        let orig_name = dec.var_bytes()?;

        // fixed fields are wrapped in a var-string of size 12
        if dec.var_int()? != 12 {
            return Err(CodecError::InvalidInput);
        }
        let collation = dec.u16_le()?;
        let column_length = dec.u32_le()?;
        let column_type = dec.u8()?;
        let flags = dec.u16_le()?;
        let decimals = dec.u8()?;
        dec.skip(2)?; // fillers

        Ok((
            dec.consumed(),
            ColumnMeta {
                catalog: Cow::Borrowed(catalog),
                schema: Cow::Borrowed(schema),
                table: Cow::Borrowed(table),
                orig_table: Cow::Borrowed(orig_table),
                name: Cow::Borrowed(name),
                orig_name: Cow::Borrowed(orig_name),
                collation,
                column_length,
                column_type,
                flags,
                decimals,
            },
        ))
    }
}

impl MessageEncode for ColumnMeta<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        if !caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            buf.put_var_bytes(&self.table)?;
            buf.put_var_bytes(&self.name)?;
            buf.put_var_int(3)?;
            buf.put_u24_le(self.column_length & 0x00ff_ffff)?;
            buf.put_var_int(1)?;
            buf.put_u8(self.column_type)?;

            if caps.contains(CapabilityFlags::CLIENT_LONG_FLAG) {
                buf.put_var_int(3)?;
                buf.put_u16_le(self.flags)?;
                buf.put_u8(self.decimals)?;
            } else {
                buf.put_var_int(2)?;
                buf.put_u8(self.flags as u8)?;
                buf.put_u8(self.decimals)?;
            }
            return Ok(());
        }

        buf.put_var_bytes(&self.catalog)?;
        buf.put_var_bytes(&self.schema)?;
        buf.put_var_bytes(&self.table)?;
        buf.put_var_bytes(&self.orig_table)?;
        buf.put_var_bytes(&self.name)?;
        buf.put_var_bytes(&self.orig_name)?;
        buf.put_var_int(12)?;
        buf.put_u16_le(self.collation)?;
        buf.put_u32_le(self.column_length)?;
        buf.put_u8(self.column_type)?;
        buf.put_u16_le(self.flags)?;
        buf.put_u8(self.decimals)?;
        buf.put_u16_le(0)
    }
}

/// LOAD DATA LOCAL INFILE request (0xfb + filename).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFileRequest<'a> {
    pub filename: Cow<'a, [u8]>,
}

impl<'a> SendFileRequest<'a> {
    pub const CMD_BYTE: u8 = 0xfb;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let filename = dec.take_rest();
        Ok((
            dec.consumed(),
            SendFileRequest {
                filename: Cow::Borrowed(filename),
            },
        ))
    }
}

impl MessageEncode for SendFileRequest<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_bytes(&self.filename)
    }
}

/// COM_STMT_PREPARE response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub column_count: u16,
    pub param_count: u16,
    pub warning_count: u16,
    /// metadata isn't optional by default
    pub with_metadata: bool,
}

impl StmtPrepareOk {
    pub const CMD_BYTE: u8 = 0x00;

    pub fn decode(input: &[u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let statement_id = dec.u32_le()?;
        let column_count = dec.u16_le()?;
        let param_count = dec.u16_le()?;
        dec.skip(1)?; // filler
        let warning_count = dec.u16_le()?;

        let mut with_metadata = true;
        if caps.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
            with_metadata = dec.u8()? != 0;
        }

        Ok((
            dec.consumed(),
            StmtPrepareOk {
                statement_id,
                column_count,
                param_count,
                warning_count,
                with_metadata,
            },
        ))
    }
}

impl MessageEncode for StmtPrepareOk {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.statement_id)?;
        buf.put_u16_le(self.column_count)?;
        buf.put_u16_le(self.param_count)?;
        buf.put_u8(0)?;
        buf.put_u16_le(self.warning_count)?;
        if caps.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
            buf.put_u8(u8::from(self.with_metadata))?;
        }
        Ok(())
    }
}

/// Text resultset row: one length-encoded string or NULL per column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row<'a> {
    pub fields: Vec<Option<Cow<'a, [u8]>>>,
}

impl<'a> Row<'a> {
    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        let mut fields = Vec::new();

        while !dec.is_empty() {
            if dec.peek_u8() == Some(0xfb) {
                dec.skip(1)?;
                fields.push(None);
            } else {
                fields.push(Some(Cow::Borrowed(dec.var_bytes()?)));
            }
        }

        Ok((dec.consumed(), Row { fields }))
    }
}

impl MessageEncode for Row<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        for field in &self.fields {
            match field {
                Some(value) => buf.put_var_bytes(value)?,
                None => buf.put_null_marker()?,
            }
        }
        Ok(())
    }
}

/// Binary resultset row.
///
/// The null-bitmap leads with a 2-bit offset; field widths come from the
/// column types, which both encode and decode need.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StmtRow<'a> {
    pub types: Vec<u8>,
    pub fields: Vec<Option<Cow<'a, [u8]>>>,
}

impl<'a> StmtRow<'a> {
    pub const CMD_BYTE: u8 = 0x00;

    pub fn decode(
        input: &'a [u8],
        _caps: CapabilityFlags,
        types: &[u8],
    ) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        let nullbits = dec.take(bytes_per_bits(types.len() + 2))?;

        let mut fields = Vec::with_capacity(types.len());
        let mut bit_pos = 2usize;
        let mut byte_pos = 0usize;
        for &typ in types {
            if bit_pos > 7 {
                bit_pos = 0;
                byte_pos += 1;
            }

            if nullbits[byte_pos] & (1 << bit_pos) == 0 {
                fields.push(Some(Cow::Borrowed(take_binary_field(&mut dec, typ)?)));
            } else {
                fields.push(None);
            }
            bit_pos += 1;
        }

        Ok((
            dec.consumed(),
            StmtRow {
                types: types.to_vec(),
                fields,
            },
        ))
    }
}

impl MessageEncode for StmtRow<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        if self.types.len() != self.fields.len() {
            return Err(CodecError::InvalidInput);
        }

        buf.put_u8(Self::CMD_BYTE)?;

        // null-bitmap starts with a 2-bit offset
        let mut bit_pos = 2usize;
        let mut null_bit_byte = 0u8;
        for field in &self.fields {
            if field.is_none() {
                null_bit_byte |= 1 << bit_pos;
            }
            bit_pos += 1;
            if bit_pos > 7 {
                buf.put_u8(null_bit_byte)?;
                bit_pos = 0;
                null_bit_byte = 0;
            }
        }
        if bit_pos != 0 {
            buf.put_u8(null_bit_byte)?;
        }

        for (typ, field) in self.types.iter().zip(&self.fields) {
            if let Some(value) = field {
                put_binary_field(buf, *typ, value)?;
            }
        }

        Ok(())
    }
}

/// COM_STATISTICS response: a human-readable blob to end of packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics<'a> {
    pub stats: Cow<'a, [u8]>,
}

impl<'a> Statistics<'a> {
    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        let stats = dec.take_rest();
        Ok((
            dec.consumed(),
            Statistics {
                stats: Cow::Borrowed(stats),
            },
        ))
    }
}

impl MessageEncode for Statistics<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_bytes(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_41() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41
    }

    fn caps_session_track() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
    }

    /// Round-trip, size-honesty, and truncated-input laws in one place.
    /// Truncations of messages with run-to-end fields may still decode (to
    /// a shorter value); fixed-shape ones must report a short read.
    macro_rules! assert_round_trip {
        ($msg:expr, $caps:expr, $decode:path) => {{
            let msg = $msg;
            let caps = $caps;
            let encoded = msg.encode_to_vec(caps).unwrap();
            assert_eq!(msg.size(caps).unwrap(), encoded.len());
            let (consumed, decoded) = $decode(&encoded, caps).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, msg);
            for cut in 1..encoded.len() {
                let short = &encoded[..encoded.len() - cut];
                assert!(
                    matches!(
                        $decode(short, caps),
                        Err(CodecError::NotEnoughInput)
                            | Err(CodecError::InvalidInput)
                            | Result::Ok(_)
                    ),
                    "truncated decode must not mis-decode"
                );
            }
        }};
    }

    fn greeting_v10() -> Greeting<'static> {
        Greeting {
            protocol_version: 0x0a,
            version: Cow::Borrowed(b"8.0.36"),
            connection_id: 8,
            auth_method_data: Cow::Borrowed(b"abcdefgh0123456789abc"),
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH,
            collation: 0x21,
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            auth_method_name: Cow::Borrowed(b"caching_sha2_password"),
        }
    }

    #[test]
    fn greeting_round_trip() {
        let greeting = greeting_v10();
        let caps = greeting.capabilities;
        assert_round_trip!(greeting, caps, Greeting::decode);
    }

    #[test]
    fn greeting_auth_data_len_21_reads_21_bytes() {
        let greeting = greeting_v10();
        let encoded = greeting.encode_to_vec(greeting.capabilities).unwrap();
        let (_, decoded) = Greeting::decode(&encoded, greeting.capabilities).unwrap();
        assert_eq!(decoded.auth_method_data.len(), 21);
    }

    #[test]
    fn greeting_short_auth_data_len_is_invalid() {
        let greeting = greeting_v10();
        let mut encoded = greeting.encode_to_vec(greeting.capabilities).unwrap();
        // the announced auth-method-data length sits right after the
        // 2+1+2+2 capability/collation/status block following the first
        // nul-terminated scramble half.
        let len_pos = 1 + greeting.version.len() + 1 + 4 + 8 + 1 + 2 + 1 + 2 + 2;
        assert_eq!(encoded[len_pos], 21);
        encoded[len_pos] = 7;
        assert_eq!(
            Greeting::decode(&encoded, greeting.capabilities).unwrap_err(),
            CodecError::InvalidInput
        );
    }

    #[test]
    fn greeting_3_21_truncated_decodes() {
        // protocol 10, but capabilities fit in 2 bytes and nothing follows
        let mut bytes = vec![0x0a];
        bytes.extend_from_slice(b"3.21.33\0");
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(b"abcdefgh\0");
        bytes.extend_from_slice(&0x000cu16.to_le_bytes());
        let (consumed, decoded) = Greeting::decode(&bytes, CapabilityFlags::empty()).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.collation, 0);
        assert_eq!(decoded.auth_method_data.as_ref(), b"abcdefgh");
    }

    #[test]
    fn ok_with_session_track_round_trip() {
        let ok = Ok {
            affected_rows: 1,
            last_insert_id: 0,
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT
                | StatusFlags::SERVER_SESSION_STATE_CHANGED,
            warning_count: 0,
            message: Cow::Borrowed(b""),
            session_changes: Cow::Borrowed(&[0x01, 0x05, 0x04, b't', b'e', b's', b't']),
        };
        let caps = caps_session_track();
        assert_round_trip!(ok, caps, Ok::decode);
    }

    #[test]
    fn ok_without_session_track_takes_message_to_end() {
        let ok = Ok {
            affected_rows: 3,
            message: Cow::Borrowed(&b"Records: 3"[..]),
            ..Ok::default()
        };
        assert_round_trip!(ok.clone(), caps_41(), Ok::decode);
        let encoded = ok.encode_to_vec(caps_41()).unwrap();
        let (_, decoded) = Ok::decode(&encoded, caps_41()).unwrap();
        assert_eq!(decoded.message.as_ref(), b"Records: 3");
    }

    #[test]
    fn eof_shape_follows_caps_not_length() {
        let eof = Eof {
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            warning_count: 2,
            ..Eof::default()
        };

        // protocol-41 short form: 5 bytes
        let bytes = eof.encode_to_vec(caps_41()).unwrap();
        assert_eq!(bytes.len(), 5);
        let (_, decoded) = Eof::decode(&bytes, caps_41()).unwrap();
        assert_eq!(decoded.warning_count, 2);

        // ok-with-0xfe-header form under deprecate-eof
        let caps = caps_session_track();
        let bytes = eof.encode_to_vec(caps).unwrap();
        assert!(bytes.len() > 5);
        let (_, decoded) = Eof::decode(&bytes, caps).unwrap();
        assert_eq!(decoded.warning_count, 2);
        assert_eq!(decoded.status_flags, eof.status_flags);
    }

    #[test]
    fn error_round_trip_with_sql_state() {
        let err = Error {
            error_code: 1064,
            sql_state: Cow::Borrowed(b"42000"),
            message: Cow::Borrowed(&b"You have an error in your SQL syntax"[..]),
        };
        assert_round_trip!(err.clone(), caps_41(), Error::decode);

        // pre-4.1 has no sql-state
        let bytes = err.encode_to_vec(CapabilityFlags::empty()).unwrap();
        let (_, decoded) = Error::decode(&bytes, CapabilityFlags::empty()).unwrap();
        assert_eq!(decoded.sql_state.as_ref(), b"");
        assert_eq!(decoded.error_code, 1064);
    }

    #[test]
    fn column_meta_41_round_trip() {
        let meta = ColumnMeta {
            catalog: Cow::Borrowed(b"def"),
            schema: Cow::Borrowed(b"test"),
            table: Cow::Borrowed(b"t1"),
            orig_table: Cow::Borrowed(b"t1"),
            name: Cow::Borrowed(b"id"),
            orig_name: Cow::Borrowed(b"id"),
            collation: 63,
            column_length: 11,
            column_type: crate::protocol::mysql::codec::field_type::LONG,
            flags: 0x5003,
            decimals: 0,
        };
        assert_round_trip!(meta, caps_41(), ColumnMeta::decode);
    }

    #[test]
    fn column_meta_legacy_round_trip() {
        let meta = ColumnMeta {
            table: Cow::Borrowed(b"t1"),
            name: Cow::Borrowed(b"id"),
            column_length: 11,
            column_type: crate::protocol::mysql::codec::field_type::LONG,
            flags: 0x0003,
            decimals: 0,
            ..ColumnMeta::default()
        };
        let caps = CapabilityFlags::CLIENT_LONG_FLAG;
        let encoded = meta.encode_to_vec(caps).unwrap();
        let (consumed, decoded) = ColumnMeta::decode(&encoded, caps).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.flags, meta.flags);
        assert_eq!(decoded.column_length, meta.column_length);
    }

    #[test]
    fn stmt_prepare_ok_round_trip() {
        let ok = StmtPrepareOk {
            statement_id: 1,
            column_count: 2,
            param_count: 1,
            warning_count: 0,
            with_metadata: true,
        };
        assert_round_trip!(ok, caps_41(), StmtPrepareOk::decode);

        let caps = caps_41() | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA;
        let no_meta = StmtPrepareOk {
            with_metadata: false,
            ..ok
        };
        let bytes = no_meta.encode_to_vec(caps).unwrap();
        let (_, decoded) = StmtPrepareOk::decode(&bytes, caps).unwrap();
        assert!(!decoded.with_metadata);
    }

    #[test]
    fn text_row_round_trip() {
        let row = Row {
            fields: vec![
                Some(Cow::Borrowed(&b"1"[..])),
                None,
                Some(Cow::Borrowed(&b"hello"[..])),
            ],
        };
        assert_round_trip!(row, caps_41(), Row::decode);
    }

    #[test]
    fn stmt_row_round_trip() {
        use crate::protocol::mysql::codec::field_type as ft;

        let row = StmtRow {
            types: vec![ft::LONG, ft::VAR_STRING, ft::LONGLONG],
            fields: vec![
                Some(Cow::Borrowed(&[1, 0, 0, 0][..])),
                None,
                Some(Cow::Borrowed(&[8, 0, 0, 0, 0, 0, 0, 0][..])),
            ],
        };
        let encoded = row.encode_to_vec(caps_41()).unwrap();
        assert_eq!(row.size(caps_41()).unwrap(), encoded.len());
        let (consumed, decoded) = StmtRow::decode(&encoded, caps_41(), &row.types).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, row);
    }

    #[test]
    fn stmt_row_unknown_type() {
        use crate::protocol::mysql::codec::field_type as ft;

        let row = StmtRow {
            types: vec![ft::LONG],
            fields: vec![Some(Cow::Borrowed(&[1, 0, 0, 0][..]))],
        };
        let encoded = row.encode_to_vec(caps_41()).unwrap();
        assert_eq!(
            StmtRow::decode(&encoded, caps_41(), &[0xf4]).unwrap_err(),
            CodecError::FieldTypeUnknown
        );
    }

    #[test]
    fn auth_method_switch_depends_on_plugin_auth() {
        let switch = AuthMethodSwitch {
            auth_method: Cow::Borrowed(b"mysql_native_password"),
            auth_method_data: Cow::Borrowed(b"12345678901234567890"),
        };

        let caps = CapabilityFlags::CLIENT_PLUGIN_AUTH;
        assert_round_trip!(switch.clone(), caps, AuthMethodSwitch::decode);

        // without plugin_auth only the header is on the wire
        let bytes = switch.encode_to_vec(CapabilityFlags::empty()).unwrap();
        assert_eq!(bytes, vec![0xfe]);
    }
}
