//! Client-side commands of the classic protocol.
//!
//! Each command knows its command byte; decode checks it and encode writes
//! it back. Capability branches run on the shared capability set.

use crate::protocol::mysql::codec::{
    bytes_per_bits, put_binary_field, take_binary_field, CodecError, CodecResult, DecodeBuf,
    EncodeBuf, MessageEncode,
};
use crate::protocol::mysql::constants::CommandCode;

use mysql_common::constants::CapabilityFlags;
use std::borrow::Cow;

/// COM_STMT_EXECUTE flag: the param-count var-int is on the wire.
pub const PARAM_COUNT_AVAILABLE: u8 = 1 << 3;

/// COM_BINLOG_DUMP_GTID flag: the SID block follows the position.
pub const BINLOG_THROUGH_GTID: u16 = 1 << 2;

macro_rules! simple_command {
    ($(#[$doc:meta])* $name:ident, $code:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl $name {
            pub const CMD_BYTE: u8 = $code as u8;

            pub fn decode(
                input: &[u8],
                _caps: CapabilityFlags,
            ) -> CodecResult<(usize, Self)> {
                let mut dec = DecodeBuf::new(input);
                if dec.u8()? != Self::CMD_BYTE {
                    return Err(CodecError::InvalidInput);
                }
                Ok((dec.consumed(), $name))
            }
        }

        impl MessageEncode for $name {
            fn encode(
                &self,
                buf: &mut EncodeBuf<'_>,
                _caps: CapabilityFlags,
            ) -> CodecResult<()> {
                buf.put_u8(Self::CMD_BYTE)
            }
        }
    };
}

simple_command!(
    /// COM_QUIT. No response; the connection closes.
    Quit,
    CommandCode::ComQuit
);
simple_command!(
    /// COM_RESET_CONNECTION: clears all session state server-side.
    ResetConnection,
    CommandCode::ComResetConnection
);
simple_command!(Ping, CommandCode::ComPing);
simple_command!(Statistics, CommandCode::ComStatistics);
simple_command!(Debug, CommandCode::ComDebug);
simple_command!(Clone, CommandCode::ComClone);

/// COM_INIT_DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSchema<'a> {
    pub schema: Cow<'a, [u8]>,
}

impl<'a> InitSchema<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComInitDB as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let schema = dec.take_rest();
        Ok((
            dec.consumed(),
            InitSchema {
                schema: Cow::Borrowed(schema),
            },
        ))
    }
}

impl MessageEncode for InitSchema<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_bytes(&self.schema)
    }
}

/// One statement parameter of a COM_QUERY with query attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam<'a> {
    pub type_and_flags: u16,
    pub name: Cow<'a, [u8]>,
    pub value: Option<Cow<'a, [u8]>>,
}

/// COM_QUERY, with the query-attributes extension when the shared
/// capabilities carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'a> {
    pub params: Vec<QueryParam<'a>>,
    pub statement: Cow<'a, [u8]>,
}

impl<'a> Query<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComQuery as u8;

    pub fn new(statement: &'a [u8]) -> Self {
        Query {
            params: Vec::new(),
            statement: Cow::Borrowed(statement),
        }
    }

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        let mut params = Vec::new();
        if caps.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
            let param_count = dec.var_int()?;

            // param-set-count is always 1
            if dec.var_int()? != 1 {
                return Err(CodecError::InvalidInput);
            }

            if param_count > 0 {
                if param_count > (dec.remaining() as u64).saturating_mul(8) {
                    return Err(CodecError::InvalidInput);
                }
                let param_count = param_count as usize;

                let nullbits = dec.take(bytes_per_bits(param_count))?;

                // new-params-bind-flag is always 1
                if dec.u8()? != 1 {
                    return Err(CodecError::InvalidInput);
                }

                params.reserve(param_count);
                for _ in 0..param_count {
                    let type_and_flags = dec.u16_le()?;
                    let name = dec.var_bytes()?;
                    params.push(QueryParam {
                        type_and_flags,
                        name: Cow::Borrowed(name),
                        value: None,
                    });
                }

                for n in 0..param_count {
                    if nullbits[n / 8] & (1 << (n % 8)) == 0 {
                        let typ = (params[n].type_and_flags & 0xff) as u8;
                        params[n].value = Some(Cow::Borrowed(take_binary_field(&mut dec, typ)?));
                    }
                }
            }
        }

        let statement = dec.take_rest();
        Ok((
            dec.consumed(),
            Query {
                params,
                statement: Cow::Borrowed(statement),
            },
        ))
    }
}

impl MessageEncode for Query<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;

        if caps.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
            buf.put_var_int(self.params.len() as u64)?;
            buf.put_var_int(1)?; // param-set-count

            if !self.params.is_empty() {
                let mut null_bit_byte = 0u8;
                let mut bit_pos = 0usize;
                for param in &self.params {
                    if param.value.is_none() {
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

                buf.put_u8(1)?; // new-params-bind-flag

                for param in &self.params {
                    buf.put_u16_le(param.type_and_flags)?;
                    buf.put_var_bytes(&param.name)?;
                }

                for param in &self.params {
                    if let Some(value) = &param.value {
                        put_binary_field(buf, (param.type_and_flags & 0xff) as u8, value)?;
                    }
                }
            }
        }

        buf.put_bytes(&self.statement)
    }
}

/// COM_FIELD_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFields<'a> {
    pub table_name: Cow<'a, [u8]>,
    pub wildcard: Cow<'a, [u8]>,
}

impl<'a> ListFields<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComFieldList as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let table_name = dec.nul_term_bytes()?;
        let wildcard = dec.take_rest();
        Ok((
            dec.consumed(),
            ListFields {
                table_name: Cow::Borrowed(table_name),
                wildcard: Cow::Borrowed(wildcard),
            },
        ))
    }
}

impl MessageEncode for ListFields<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_nul_term(&self.table_name)?;
        buf.put_bytes(&self.wildcard)
    }
}

/// COM_REFRESH with its sub-command bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reload {
    pub command: u8,
}

impl Reload {
    pub const CMD_BYTE: u8 = CommandCode::ComRefresh as u8;

    pub fn decode(input: &[u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let command = dec.u8()?;
        Ok((dec.consumed(), Reload { command }))
    }
}

impl MessageEncode for Reload {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u8(self.command)
    }
}

/// COM_PROCESS_KILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kill {
    pub connection_id: u32,
}

impl Kill {
    pub const CMD_BYTE: u8 = CommandCode::ComProcessKill as u8;

    pub fn decode(input: &[u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let connection_id = dec.u32_le()?;
        Ok((dec.consumed(), Kill { connection_id }))
    }
}

impl MessageEncode for Kill {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.connection_id)
    }
}

/// File content sent in response to a server::SendFileRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFile<'a> {
    pub payload: Cow<'a, [u8]>,
}

impl<'a> SendFile<'a> {
    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        let payload = dec.take_rest();
        Ok((
            dec.consumed(),
            SendFile {
                payload: Cow::Borrowed(payload),
            },
        ))
    }
}

impl MessageEncode for SendFile<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_bytes(&self.payload)
    }
}

/// Raw auth payload from the client mid-handshake (scramble response,
/// cleartext password, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMethodData<'a> {
    pub auth_method_data: Cow<'a, [u8]>,
}

impl<'a> AuthMethodData<'a> {
    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
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
        buf.put_bytes(&self.auth_method_data)
    }
}

/// COM_STMT_PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtPrepare<'a> {
    pub statement: Cow<'a, [u8]>,
}

impl<'a> StmtPrepare<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComStmtPrepare as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let statement = dec.take_rest();
        Ok((
            dec.consumed(),
            StmtPrepare {
                statement: Cow::Borrowed(statement),
            },
        ))
    }
}

impl MessageEncode for StmtPrepare<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_bytes(&self.statement)
    }
}

/// Parameter definition of a prepared statement, kept by the router between
/// COM_STMT_PREPARE and COM_STMT_EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StmtParamDef {
    pub type_and_flags: u16,
    pub name: Vec<u8>,
    /// data already sent via COM_STMT_SEND_LONG_DATA
    pub param_already_sent: bool,
}

/// COM_STMT_EXECUTE.
///
/// Decoding needs the parameter definitions of the statement; the caller
/// supplies a lookup from statement-id to the known metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtExecute<'a> {
    pub statement_id: u32,
    pub flags: u8,
    pub iteration_count: u32,
    pub new_params_bound: bool,
    pub types: Vec<StmtParamDef>,
    pub values: Vec<Option<Cow<'a, [u8]>>>,
}

impl<'a> StmtExecute<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComStmtExecute as u8;

    pub fn decode<F>(
        input: &'a [u8],
        caps: CapabilityFlags,
        metadata_lookup: F,
    ) -> CodecResult<(usize, Self)>
    where
        F: FnOnce(u32) -> Option<Vec<StmtParamDef>>,
    {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        let statement_id = dec.u32_le()?;
        let flags = dec.u8()?;
        let iteration_count = dec.u32_le()?;

        let metadata =
            metadata_lookup(statement_id).ok_or(CodecError::StatementIdNotFound)?;
        let mut param_count = metadata.len();

        let supports_query_attributes =
            caps.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES);

        if supports_query_attributes && (flags & PARAM_COUNT_AVAILABLE) != 0 {
            let wire_count = dec.var_int()?;
            // the param-count can grow through attributes, never shrink
            if wire_count < param_count as u64 {
                return Err(CodecError::InvalidInput);
            }
            if wire_count > (dec.remaining() as u64).saturating_mul(8) {
                return Err(CodecError::InvalidInput);
            }
            param_count = wire_count as usize;
        }

        if param_count == 0 {
            return Ok((
                dec.consumed(),
                StmtExecute {
                    statement_id,
                    flags,
                    iteration_count,
                    new_params_bound: false,
                    types: Vec::new(),
                    values: Vec::new(),
                },
            ));
        }

        let nullbits = dec.take(bytes_per_bits(param_count))?;
        let new_params_bound = dec.u8()?;

        let types: Vec<StmtParamDef> = match new_params_bound {
            // no new params, use the last known metadata
            0 => metadata.clone(),
            1 => {
                // each type is at least a FixedInt<2>; refuse to reserve
                // more than the buffer can hold.
                if param_count >= input.len() / 2 {
                    return Err(CodecError::InvalidInput);
                }

                let mut types = Vec::with_capacity(param_count);
                for _ in 0..param_count {
                    let type_and_flags = dec.u16_le()?;
                    let name = if supports_query_attributes {
                        dec.var_bytes()?.to_vec()
                    } else {
                        Vec::new()
                    };
                    types.push(StmtParamDef {
                        type_and_flags,
                        name,
                        param_already_sent: false,
                    });
                }
                types
            }
            _ => return Err(CodecError::InvalidInput),
        };

        if types.len() != param_count {
            return Err(CodecError::InvalidInput);
        }

        let mut values: Vec<Option<Cow<'a, [u8]>>> = Vec::with_capacity(param_count);
        for n in 0..param_count {
            let param_already_sent = metadata
                .get(n)
                .map(|def| def.param_already_sent)
                .unwrap_or(false);

            if param_already_sent {
                // value arrived via COM_STMT_SEND_LONG_DATA
                values.push(Some(Cow::Borrowed(&[][..])));
            } else if nullbits[n / 8] & (1 << (n % 8)) == 0 {
                let typ = (types[n].type_and_flags & 0xff) as u8;
                values.push(Some(Cow::Borrowed(take_binary_field(&mut dec, typ)?)));
            } else {
                values.push(None);
            }
        }

        Ok((
            dec.consumed(),
            StmtExecute {
                statement_id,
                flags,
                iteration_count,
                new_params_bound: new_params_bound == 1,
                types,
                values,
            },
        ))
    }
}

impl MessageEncode for StmtExecute<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.statement_id)?;
        buf.put_u8(self.flags)?;
        buf.put_u32_le(self.iteration_count)?;

        let supports_query_attributes =
            caps.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES);

        if supports_query_attributes && (self.flags & PARAM_COUNT_AVAILABLE) != 0 {
            buf.put_var_int(self.values.len() as u64)?;
        }

        if self.values.is_empty() {
            return Ok(());
        }

        let mut null_bit_byte = 0u8;
        let mut bit_pos = 0usize;
        for value in &self.values {
            if value.is_none() {
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

        buf.put_u8(u8::from(self.new_params_bound))?;

        if self.new_params_bound {
            for def in &self.types {
                buf.put_u16_le(def.type_and_flags)?;
                if supports_query_attributes {
                    buf.put_var_bytes(&def.name)?;
                }
            }
        }

        for (def, value) in self.types.iter().zip(&self.values) {
            if def.param_already_sent {
                continue;
            }
            if let Some(value) = value {
                put_binary_field(buf, (def.type_and_flags & 0xff) as u8, value)?;
            }
        }

        Ok(())
    }
}

/// COM_STMT_SEND_LONG_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtParamAppendData<'a> {
    pub statement_id: u32,
    pub param_id: u16,
    pub data: Cow<'a, [u8]>,
}

impl<'a> StmtParamAppendData<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComStmtSendLongData as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let statement_id = dec.u32_le()?;
        let param_id = dec.u16_le()?;
        let data = dec.take_rest();
        Ok((
            dec.consumed(),
            StmtParamAppendData {
                statement_id,
                param_id,
                data: Cow::Borrowed(data),
            },
        ))
    }
}

impl MessageEncode for StmtParamAppendData<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.statement_id)?;
        buf.put_u16_le(self.param_id)?;
        buf.put_bytes(&self.data)
    }
}

macro_rules! stmt_id_command {
    ($(#[$doc:meta])* $name:ident, $code:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub statement_id: u32,
        }

        impl $name {
            pub const CMD_BYTE: u8 = $code as u8;

            pub fn decode(
                input: &[u8],
                _caps: CapabilityFlags,
            ) -> CodecResult<(usize, Self)> {
                let mut dec = DecodeBuf::new(input);
                if dec.u8()? != Self::CMD_BYTE {
                    return Err(CodecError::InvalidInput);
                }
                let statement_id = dec.u32_le()?;
                Ok((dec.consumed(), $name { statement_id }))
            }
        }

        impl MessageEncode for $name {
            fn encode(
                &self,
                buf: &mut EncodeBuf<'_>,
                _caps: CapabilityFlags,
            ) -> CodecResult<()> {
                buf.put_u8(Self::CMD_BYTE)?;
                buf.put_u32_le(self.statement_id)
            }
        }
    };
}

stmt_id_command!(
    /// COM_STMT_CLOSE. No response.
    StmtClose,
    CommandCode::ComStmtClose
);
stmt_id_command!(StmtReset, CommandCode::ComStmtReset);

/// COM_SET_OPTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOption {
    pub option: u16,
}

impl SetOption {
    pub const CMD_BYTE: u8 = CommandCode::ComSetOption as u8;

    pub fn decode(input: &[u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let option = dec.u16_le()?;
        Ok((dec.consumed(), SetOption { option }))
    }
}

impl MessageEncode for SetOption {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u16_le(self.option)
    }
}

/// COM_STMT_FETCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtFetch {
    pub statement_id: u32,
    pub row_count: u32,
}

impl StmtFetch {
    pub const CMD_BYTE: u8 = CommandCode::ComStmtFetch as u8;

    pub fn decode(input: &[u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let statement_id = dec.u32_le()?;
        let row_count = dec.u32_le()?;
        Ok((
            dec.consumed(),
            StmtFetch {
                statement_id,
                row_count,
            },
        ))
    }
}

impl MessageEncode for StmtFetch {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.statement_id)?;
        buf.put_u32_le(self.row_count)
    }
}

/// Client handshake response ("client greeting").
///
/// The short pre-TLS form has no username: a client that wants TLS sends
/// only the capability/collation head, switches to TLS, then sends the full
/// greeting encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Greeting<'a> {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub collation: u8,
    pub username: Cow<'a, [u8]>,
    pub auth_method_data: Cow<'a, [u8]>,
    pub schema: Cow<'a, [u8]>,
    pub auth_method_name: Cow<'a, [u8]>,
    /// raw length-encoded connect-attributes block
    pub attributes: Cow<'a, [u8]>,
}

impl<'a> Greeting<'a> {
    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);

        let cap_lower = dec.u16_le()?;
        let mut client_caps = CapabilityFlags::from_bits_truncate(u32::from(cap_lower));
        let mut shared = caps & client_caps;

        if !shared.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            // HandshakeResponse320
            let max_packet_size = dec.u24_le()?;
            let username = dec.nul_term_bytes()?;

            let (auth_method_data, schema): (&[u8], &[u8]) =
                if shared.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                    let auth = dec.nul_term_bytes()?;
                    let schema = dec.take_rest();
                    (auth, schema)
                } else {
                    (dec.take_rest(), &[])
                };

            return Ok((
                dec.consumed(),
                Greeting {
                    capabilities: client_caps,
                    max_packet_size,
                    collation: 0,
                    username: Cow::Borrowed(username),
                    auth_method_data: Cow::Borrowed(auth_method_data),
                    schema: Cow::Borrowed(schema),
                    ..Greeting::default()
                },
            ));
        }

        let cap_upper = dec.u16_le()?;
        client_caps = CapabilityFlags::from_bits_truncate(
            u32::from(cap_lower) | (u32::from(cap_upper) << 16),
        );
        shared = caps & client_caps;

        let max_packet_size = dec.u32_le()?;
        let collation = dec.u8()?;
        dec.skip(23)?;

        let head_end = dec.consumed();
        let username = match dec.nul_term_bytes() {
            Result::Ok(username) => username,
            Err(CodecError::NotEnoughInput)
                if shared.contains(CapabilityFlags::CLIENT_SSL) =>
            {
                // short SSL greeting: TLS handshake comes next
                return Ok((
                    head_end,
                    Greeting {
                        capabilities: client_caps,
                        max_packet_size,
                        collation,
                        ..Greeting::default()
                    },
                ));
            }
            Err(e) => return Err(e),
        };

        let auth_method_data: &[u8] =
            if shared.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                dec.var_bytes()?
            } else if shared.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let len = dec.u8()? as usize;
                dec.take(len)?
            } else {
                dec.nul_term_bytes()?
            };

        let schema: &[u8] = if shared.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            dec.nul_term_bytes()?
        } else {
            &[]
        };

        let auth_method_name: &[u8] =
            if shared.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                if dec.is_empty() {
                    // even with plugin_auth set, a missing method name is fine
                    &[]
                } else {
                    dec.nul_term_bytes()?
                }
            } else {
                &[]
            };

        let attributes: &[u8] = if shared.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            dec.var_bytes()?
        } else {
            &[]
        };

        Ok((
            dec.consumed(),
            Greeting {
                capabilities: client_caps,
                max_packet_size,
                collation,
                username: Cow::Borrowed(username),
                auth_method_data: Cow::Borrowed(auth_method_data),
                schema: Cow::Borrowed(schema),
                auth_method_name: Cow::Borrowed(auth_method_name),
                attributes: Cow::Borrowed(attributes),
            },
        ))
    }

    pub fn into_owned(self) -> Greeting<'static> {
        Greeting {
            capabilities: self.capabilities,
            max_packet_size: self.max_packet_size,
            collation: self.collation,
            username: Cow::Owned(self.username.into_owned()),
            auth_method_data: Cow::Owned(self.auth_method_data.into_owned()),
            schema: Cow::Owned(self.schema.into_owned()),
            auth_method_name: Cow::Owned(self.auth_method_name.into_owned()),
            attributes: Cow::Owned(self.attributes.into_owned()),
        }
    }
}

impl MessageEncode for Greeting<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        let shared = self.capabilities & caps;

        if shared.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            buf.put_u32_le(self.capabilities.bits())?;
            buf.put_u32_le(self.max_packet_size)?;
            buf.put_u8(self.collation)?;
            buf.put_bytes(&[0u8; 23])?;

            // empty username with SSL set is the short pre-TLS greeting
            if shared.contains(CapabilityFlags::CLIENT_SSL) && self.username.is_empty() {
                return Ok(());
            }

            buf.put_nul_term(&self.username)?;

            if shared.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                buf.put_var_bytes(&self.auth_method_data)?;
            } else if shared.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                if self.auth_method_data.len() > u8::MAX as usize {
                    return Err(CodecError::InvalidInput);
                }
                buf.put_u8(self.auth_method_data.len() as u8)?;
                buf.put_bytes(&self.auth_method_data)?;
            } else {
                buf.put_nul_term(&self.auth_method_data)?;
            }

            if shared.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                buf.put_nul_term(&self.schema)?;
            }

            if shared.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
                if shared.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                    buf.put_nul_term(&self.auth_method_name)?;
                }
                buf.put_var_bytes(&self.attributes)?;
            } else if shared.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
                && !self.auth_method_name.is_empty()
            {
                // older clients: nothing may follow the method name
                buf.put_nul_term(&self.auth_method_name)?;
            }
        } else {
            buf.put_u16_le((self.capabilities.bits() & 0xffff) as u16)?;
            buf.put_u24_le(self.max_packet_size & 0x00ff_ffff)?;
            buf.put_nul_term(&self.username)?;
            if shared.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                buf.put_nul_term(&self.auth_method_data)?;
                buf.put_bytes(&self.schema)?;
            } else {
                buf.put_bytes(&self.auth_method_data)?;
            }
        }

        Ok(())
    }
}

/// COM_CHANGE_USER.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeUser<'a> {
    pub username: Cow<'a, [u8]>,
    pub auth_method_data: Cow<'a, [u8]>,
    pub schema: Cow<'a, [u8]>,
    pub collation: u16,
    pub auth_method_name: Cow<'a, [u8]>,
    /// raw length-encoded connect-attributes block
    pub attributes: Cow<'a, [u8]>,
}

impl<'a> ChangeUser<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComChangeUser as u8;

    pub fn decode(input: &'a [u8], caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }

        let username = dec.nul_term_bytes()?;

        let auth_method_data: &[u8] =
            if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let len = dec.u8()? as usize;
                dec.take(len)?
            } else {
                dec.nul_term_bytes()?
            };

        let schema = dec.nul_term_bytes()?;

        // 3.23.x-4.0 don't send more
        if dec.is_empty() {
            return Ok((
                dec.consumed(),
                ChangeUser {
                    username: Cow::Borrowed(username),
                    auth_method_data: Cow::Borrowed(auth_method_data),
                    schema: Cow::Borrowed(schema),
                    ..ChangeUser::default()
                },
            ));
        }

        let collation = dec.u16_le()?;

        let auth_method_name: &[u8] = if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        {
            dec.nul_term_bytes()?
        } else {
            &[]
        };

        let attributes: &[u8] = if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            dec.var_bytes()?
        } else {
            &[]
        };

        Ok((
            dec.consumed(),
            ChangeUser {
                username: Cow::Borrowed(username),
                auth_method_data: Cow::Borrowed(auth_method_data),
                schema: Cow::Borrowed(schema),
                collation,
                auth_method_name: Cow::Borrowed(auth_method_name),
                attributes: Cow::Borrowed(attributes),
            },
        ))
    }

    pub fn into_owned(self) -> ChangeUser<'static> {
        ChangeUser {
            username: Cow::Owned(self.username.into_owned()),
            auth_method_data: Cow::Owned(self.auth_method_data.into_owned()),
            schema: Cow::Owned(self.schema.into_owned()),
            collation: self.collation,
            auth_method_name: Cow::Owned(self.auth_method_name.into_owned()),
            attributes: Cow::Owned(self.attributes.into_owned()),
        }
    }
}

impl MessageEncode for ChangeUser<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_nul_term(&self.username)?;

        if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            if self.auth_method_data.len() > u8::MAX as usize {
                return Err(CodecError::InvalidInput);
            }
            buf.put_u8(self.auth_method_data.len() as u8)?;
            buf.put_bytes(&self.auth_method_data)?;
        } else {
            buf.put_nul_term(&self.auth_method_data)?;
        }
        buf.put_nul_term(&self.schema)?;

        // 4.1 and later have a collation; the server keys this off plugin
        // auth and connect attributes, not protocol_41
        if self.collation != 0
            || caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
            || caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS)
        {
            buf.put_u16_le(self.collation)?;
            if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                buf.put_nul_term(&self.auth_method_name)?;
            }
            if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
                buf.put_var_bytes(&self.attributes)?;
            }
        }

        Ok(())
    }
}

/// COM_BINLOG_DUMP. The server streams binlog events until the connection
/// closes; it never goes back to idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDump<'a> {
    pub position: u32,
    pub flags: u16,
    pub server_id: u32,
    pub filename: Cow<'a, [u8]>,
}

impl<'a> BinlogDump<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComBinlogDump as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let position = dec.u32_le()?;
        let flags = dec.u16_le()?;
        let server_id = dec.u32_le()?;
        let filename = dec.take_rest();
        Ok((
            dec.consumed(),
            BinlogDump {
                position,
                flags,
                server_id,
                filename: Cow::Borrowed(filename),
            },
        ))
    }
}

impl MessageEncode for BinlogDump<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.position)?;
        buf.put_u16_le(self.flags)?;
        buf.put_u32_le(self.server_id)?;
        buf.put_bytes(&self.filename)
    }
}

/// COM_BINLOG_DUMP_GTID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpGtid<'a> {
    pub flags: u16,
    pub server_id: u32,
    pub filename: Cow<'a, [u8]>,
    pub position: u64,
    pub sids: Cow<'a, [u8]>,
}

impl<'a> BinlogDumpGtid<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComBinlogDumpGtid as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let flags = dec.u16_le()?;
        let server_id = dec.u32_le()?;
        let filename_len = dec.u32_le()? as usize;
        let filename = dec.take(filename_len)?;
        let position = dec.u64_le()?;

        let sids: &[u8] = if flags & BINLOG_THROUGH_GTID != 0 {
            let sids_len = dec.u32_le()? as usize;
            dec.take(sids_len)?
        } else {
            &[]
        };

        Ok((
            dec.consumed(),
            BinlogDumpGtid {
                flags,
                server_id,
                filename: Cow::Borrowed(filename),
                position,
                sids: Cow::Borrowed(sids),
            },
        ))
    }
}

impl MessageEncode for BinlogDumpGtid<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u16_le(self.flags)?;
        buf.put_u32_le(self.server_id)?;
        buf.put_u32_le(self.filename.len() as u32)?;
        buf.put_bytes(&self.filename)?;
        buf.put_u64_le(self.position)?;
        if self.flags & BINLOG_THROUGH_GTID != 0 {
            buf.put_u32_le(self.sids.len() as u32)?;
            buf.put_bytes(&self.sids)?;
        }
        Ok(())
    }
}

/// COM_REGISTER_SLAVE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReplica<'a> {
    pub server_id: u32,
    pub hostname: Cow<'a, [u8]>,
    pub username: Cow<'a, [u8]>,
    pub password: Cow<'a, [u8]>,
    pub port: u16,
    pub replication_rank: u32,
    pub master_id: u32,
}

impl<'a> RegisterReplica<'a> {
    pub const CMD_BYTE: u8 = CommandCode::ComRegisterReplica as u8;

    pub fn decode(input: &'a [u8], _caps: CapabilityFlags) -> CodecResult<(usize, Self)> {
        let mut dec = DecodeBuf::new(input);
        if dec.u8()? != Self::CMD_BYTE {
            return Err(CodecError::InvalidInput);
        }
        let server_id = dec.u32_le()?;
        let hostname_len = dec.u8()? as usize;
        let hostname = dec.take(hostname_len)?;
        let username_len = dec.u8()? as usize;
        let username = dec.take(username_len)?;
        let password_len = dec.u8()? as usize;
        let password = dec.take(password_len)?;
        let port = dec.u16_le()?;
        let replication_rank = dec.u32_le()?;
        let master_id = dec.u32_le()?;

        Ok((
            dec.consumed(),
            RegisterReplica {
                server_id,
                hostname: Cow::Borrowed(hostname),
                username: Cow::Borrowed(username),
                password: Cow::Borrowed(password),
                port,
                replication_rank,
                master_id,
            },
        ))
    }
}

impl MessageEncode for RegisterReplica<'_> {
    fn encode(&self, buf: &mut EncodeBuf<'_>, _caps: CapabilityFlags) -> CodecResult<()> {
        buf.put_u8(Self::CMD_BYTE)?;
        buf.put_u32_le(self.server_id)?;
        for field in [&self.hostname, &self.username, &self.password] {
            if field.len() > u8::MAX as usize {
                return Err(CodecError::InvalidInput);
            }
            buf.put_u8(field.len() as u8)?;
            buf.put_bytes(field)?;
        }
        buf.put_u16_le(self.port)?;
        buf.put_u32_le(self.replication_rank)?;
        buf.put_u32_le(self.master_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::codec::field_type as ft;

    fn caps_qa() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
    }

    #[test]
    fn quit_is_one_byte() {
        let bytes = Quit.encode_to_vec(CapabilityFlags::empty()).unwrap();
        assert_eq!(bytes, vec![0x01]);
        let (consumed, _) = Quit::decode(&bytes, CapabilityFlags::empty()).unwrap();
        assert_eq!(consumed, 1);
    }

    #[test]
    fn plain_query_round_trip() {
        let query = Query::new(b"SELECT 1");
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let bytes = query.encode_to_vec(caps).unwrap();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(&bytes[1..], b"SELECT 1");
        let (consumed, decoded) = Query::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, query);
    }

    #[test]
    fn query_with_attributes_round_trip() {
        let query = Query {
            params: vec![
                QueryParam {
                    type_and_flags: u16::from(ft::TINY),
                    name: Cow::Borrowed(b"router.trace"),
                    value: Some(Cow::Borrowed(&[0x01][..])),
                },
                QueryParam {
                    type_and_flags: u16::from(ft::VAR_STRING),
                    name: Cow::Borrowed(b"other"),
                    value: None,
                },
            ],
            statement: Cow::Borrowed(b"SELECT 1"),
        };
        let bytes = query.encode_to_vec(caps_qa()).unwrap();
        assert_eq!(query.size(caps_qa()).unwrap(), bytes.len());
        let (consumed, decoded) = Query::decode(&bytes, caps_qa()).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, query);
    }

    #[test]
    fn query_attribute_caps_mismatch_is_not_silent() {
        // an attribute-carrying query decoded without the capability keeps
        // the whole payload as statement text
        let query = Query {
            params: vec![QueryParam {
                type_and_flags: u16::from(ft::TINY),
                name: Cow::Borrowed(b"n"),
                value: Some(Cow::Borrowed(&[0x01][..])),
            }],
            statement: Cow::Borrowed(b"SELECT 1"),
        };
        let bytes = query.encode_to_vec(caps_qa()).unwrap();
        let (_, decoded) =
            Query::decode(&bytes, CapabilityFlags::CLIENT_PROTOCOL_41).unwrap();
        assert_ne!(decoded.statement.as_ref(), b"SELECT 1");
    }

    #[test]
    fn query_bad_param_set_count() {
        let mut bytes = vec![0x03];
        bytes.push(0x00); // param_count = 0
        bytes.push(0x02); // param_set_count = 2
        bytes.extend_from_slice(b"SELECT 1");
        assert_eq!(
            Query::decode(&bytes, caps_qa()).unwrap_err(),
            CodecError::InvalidInput
        );
    }

    #[test]
    fn stmt_execute_round_trip_with_metadata() {
        let exec = StmtExecute {
            statement_id: 1,
            flags: 0,
            iteration_count: 1,
            new_params_bound: true,
            types: vec![StmtParamDef {
                type_and_flags: u16::from(ft::LONG),
                name: Vec::new(),
                param_already_sent: false,
            }],
            values: vec![Some(Cow::Borrowed(&[0x2a, 0, 0, 0][..]))],
        };
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let bytes = exec.encode_to_vec(caps).unwrap();
        assert_eq!(exec.size(caps).unwrap(), bytes.len());

        let (consumed, decoded) =
            StmtExecute::decode(&bytes, caps, |stmt_id| {
                assert_eq!(stmt_id, 1);
                Some(vec![StmtParamDef {
                    type_and_flags: u16::from(ft::LONG),
                    name: Vec::new(),
                    param_already_sent: false,
                }])
            })
            .unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, exec);
    }

    #[test]
    fn stmt_execute_unknown_statement_id() {
        let exec = StmtExecute {
            statement_id: 42,
            flags: 0,
            iteration_count: 1,
            new_params_bound: false,
            types: Vec::new(),
            values: Vec::new(),
        };
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let bytes = exec.encode_to_vec(caps).unwrap();
        assert_eq!(
            StmtExecute::decode(&bytes, caps, |_| None).unwrap_err(),
            CodecError::StatementIdNotFound
        );
    }

    #[test]
    fn stmt_execute_reuses_metadata_when_not_rebound() {
        let metadata = vec![StmtParamDef {
            type_and_flags: u16::from(ft::TINY),
            name: Vec::new(),
            param_already_sent: false,
        }];
        let exec = StmtExecute {
            statement_id: 7,
            flags: 0,
            iteration_count: 1,
            new_params_bound: false,
            types: metadata.clone(),
            values: vec![Some(Cow::Borrowed(&[0x05][..]))],
        };
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let bytes = exec.encode_to_vec(caps).unwrap();
        let (_, decoded) =
            StmtExecute::decode(&bytes, caps, |_| Some(metadata.clone())).unwrap();
        assert_eq!(decoded.types, metadata);
        assert_eq!(decoded.values, exec.values);
    }

    #[test]
    fn stmt_execute_rejects_oversized_param_count() {
        // flags say the param count is on the wire, and it is absurd
        let mut bytes = vec![0x17];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(PARAM_COUNT_AVAILABLE);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;
        assert_eq!(
            StmtExecute::decode(&bytes, caps, |_| Some(Vec::new())).unwrap_err(),
            CodecError::InvalidInput
        );
    }

    #[test]
    fn client_greeting_round_trip() {
        let greeting = Greeting {
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            collation: 0x21,
            username: Cow::Borrowed(b"app"),
            auth_method_data: Cow::Borrowed(&[0xaa; 20][..]),
            schema: Cow::Borrowed(b"prod"),
            auth_method_name: Cow::Borrowed(b"mysql_native_password"),
            attributes: Cow::Borrowed(b""),
        };
        let caps = greeting.capabilities;
        let bytes = greeting.encode_to_vec(caps).unwrap();
        assert_eq!(greeting.size(caps).unwrap(), bytes.len());
        let (consumed, decoded) = Greeting::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, greeting);
    }

    #[test]
    fn client_greeting_short_ssl_form() {
        let greeting = Greeting {
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_SSL,
            max_packet_size: 1 << 24,
            collation: 0x21,
            ..Greeting::default()
        };
        let caps = greeting.capabilities;
        let bytes = greeting.encode_to_vec(caps).unwrap();
        // 4 caps + 4 max-packet + 1 collation + 23 filler
        assert_eq!(bytes.len(), 32);
        let (consumed, decoded) = Greeting::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, 32);
        assert!(decoded.username.is_empty());
        assert!(decoded.capabilities.contains(CapabilityFlags::CLIENT_SSL));
    }

    #[test]
    fn change_user_round_trip() {
        let change = ChangeUser {
            username: Cow::Borrowed(b"other"),
            auth_method_data: Cow::Borrowed(&[0xbb; 20][..]),
            schema: Cow::Borrowed(b"test"),
            collation: 45,
            auth_method_name: Cow::Borrowed(b"caching_sha2_password"),
            attributes: Cow::Borrowed(b""),
        };
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_ATTRS;
        let bytes = change.encode_to_vec(caps).unwrap();
        let (consumed, decoded) = ChangeUser::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, change);
    }

    #[test]
    fn binlog_dump_gtid_round_trip() {
        let dump = BinlogDumpGtid {
            flags: BINLOG_THROUGH_GTID,
            server_id: 10,
            filename: Cow::Borrowed(b"binlog.000001"),
            position: 4,
            sids: Cow::Borrowed(&[0u8; 16][..]),
        };
        let caps = CapabilityFlags::empty();
        let bytes = dump.encode_to_vec(caps).unwrap();
        let (consumed, decoded) = BinlogDumpGtid::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, dump);

        let dump_plain = BinlogDumpGtid {
            flags: 0,
            sids: Cow::Borrowed(b""),
            ..dump
        };
        let bytes = dump_plain.encode_to_vec(caps).unwrap();
        let (_, decoded) = BinlogDumpGtid::decode(&bytes, caps).unwrap();
        assert!(decoded.sids.is_empty());
    }

    #[test]
    fn register_replica_round_trip() {
        let reg = RegisterReplica {
            server_id: 2,
            hostname: Cow::Borrowed(b"replica-1"),
            username: Cow::Borrowed(b"repl"),
            password: Cow::Borrowed(b"secret"),
            port: 3306,
            replication_rank: 0,
            master_id: 0,
        };
        let caps = CapabilityFlags::empty();
        let bytes = reg.encode_to_vec(caps).unwrap();
        let (consumed, decoded) = RegisterReplica::decode(&bytes, caps).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, reg);
    }

    #[test]
    fn stmt_fetch_and_friends_round_trip() {
        let caps = CapabilityFlags::empty();

        let fetch = StmtFetch {
            statement_id: 3,
            row_count: 10,
        };
        let bytes = fetch.encode_to_vec(caps).unwrap();
        assert_eq!(StmtFetch::decode(&bytes, caps).unwrap().1, fetch);

        let close = StmtClose { statement_id: 3 };
        let bytes = close.encode_to_vec(caps).unwrap();
        assert_eq!(StmtClose::decode(&bytes, caps).unwrap().1, close);

        let kill = Kill { connection_id: 99 };
        let bytes = kill.encode_to_vec(caps).unwrap();
        assert_eq!(Kill::decode(&bytes, caps).unwrap().1, kill);

        let opt = SetOption { option: 1 };
        let bytes = opt.encode_to_vec(caps).unwrap();
        assert_eq!(SetOption::decode(&bytes, caps).unwrap().1, opt);
    }
}
