use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

pub const COMPRESSED_HEADER_LEN: usize = 7;

/// Payloads shorter than this are framed uncompressed even when the
/// compression capability is on.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// auth-plugin-data-part-1: the first 8 bytes of the scramble, used for
/// password hashing before the full scramble is known.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// Full scramble length (auth-plugin-data-part-1 + auth-plugin-data-part-2).
pub const SCRAMBLE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

impl AuthPluginName {
    pub fn from_bytes(name: &[u8]) -> Self {
        match name {
            b"mysql_native_password" => AuthPluginName::AuthNativePassword,
            b"caching_sha2_password" => AuthPluginName::AuthCachingSha2Password,
            b"sha256_password" => AuthPluginName::AuthSha256Password,
            b"mysql_old_password" => AuthPluginName::AuthMySQlOldPassword,
            _ => AuthPluginName::UnKnowPluginName,
        }
    }
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterReplica,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComClone,
    ComEnd,
}

#[inline]
pub fn all_command_names() -> &'static HashMap<u8, &'static str> {
    static COMMAND_NAMES: std::sync::OnceLock<HashMap<u8, &'static str>> =
        std::sync::OnceLock::new();
    COMMAND_NAMES.get_or_init(|| {
        HashMap::from([
            (CommandCode::ComSleep as u8, "ComSleep"),
            (CommandCode::ComQuit as u8, "ComQuit"),
            (CommandCode::ComInitDB as u8, "ComInitDB"),
            (CommandCode::ComQuery as u8, "ComQuery"),
            (CommandCode::ComFieldList as u8, "ComFieldList"),
            (CommandCode::ComCreateDB as u8, "ComCreateDB"),
            (CommandCode::ComDropDB as u8, "ComDropDB"),
            (CommandCode::ComRefresh as u8, "ComRefresh"),
            (CommandCode::ComShutdown as u8, "ComShutdown"),
            (CommandCode::ComStatistics as u8, "ComStatistics"),
            (CommandCode::ComProcessInfo as u8, "ComProcessInfo"),
            (CommandCode::ComConnect as u8, "ComConnect"),
            (CommandCode::ComProcessKill as u8, "ComProcessKill"),
            (CommandCode::ComDebug as u8, "ComDebug"),
            (CommandCode::ComPing as u8, "ComPing"),
            (CommandCode::ComTime as u8, "ComTime"),
            (CommandCode::ComDelayedInsert as u8, "ComDelayedInsert"),
            (CommandCode::ComChangeUser as u8, "ComChangeUser"),
            (CommandCode::ComBinlogDump as u8, "ComBinlogDump"),
            (CommandCode::ComTableDump as u8, "ComTableDump"),
            (CommandCode::ComConnectOut as u8, "ComConnectOut"),
            (CommandCode::ComRegisterReplica as u8, "ComRegisterReplica"),
            (CommandCode::ComStmtPrepare as u8, "ComStmtPrepare"),
            (CommandCode::ComStmtExecute as u8, "ComStmtExecute"),
            (CommandCode::ComStmtSendLongData as u8, "ComStmtSendLongData"),
            (CommandCode::ComStmtClose as u8, "ComStmtClose"),
            (CommandCode::ComStmtReset as u8, "ComStmtReset"),
            (CommandCode::ComSetOption as u8, "ComSetOption"),
            (CommandCode::ComStmtFetch as u8, "ComStmtFetch"),
            (CommandCode::ComDaemon as u8, "ComDaemon"),
            (CommandCode::ComBinlogDumpGtid as u8, "ComBinlogDumpGtid"),
            (CommandCode::ComResetConnection as u8, "ComResetConnection"),
            (CommandCode::ComClone as u8, "ComClone"),
        ])
    })
}

#[inline]
pub fn command_name(com_code: u8) -> &'static str {
    all_command_names()
        .get(&com_code)
        .copied()
        .unwrap_or("ComUnknown")
}

/// Session-state-change record types carried in the OK packet's
/// `session_state_info` payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SessionStateType {
    SystemVariables = 0,
    Schema = 1,
    StateChange = 2,
    Gtids = 3,
    TransactionCharacteristics = 4,
    TransactionState = 5,
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn command_code_values() {
        assert_eq!(CommandCode::ComQuit as u8, 0x01);
        assert_eq!(CommandCode::ComQuery as u8, 0x03);
        assert_eq!(CommandCode::ComStmtExecute as u8, 0x17);
        assert_eq!(CommandCode::ComBinlogDumpGtid as u8, 0x1e);
        assert_eq!(CommandCode::ComResetConnection as u8, 0x1f);
        assert_eq!(CommandCode::ComClone as u8, 0x20);
        assert_eq!(command_name(0x03), "ComQuery");
    }

    #[test]
    pub fn auth_plugin_names() {
        assert_eq!(
            AuthPluginName::AuthCachingSha2Password.as_ref(),
            "caching_sha2_password"
        );
        assert_eq!(
            AuthPluginName::from_bytes(b"mysql_native_password"),
            AuthPluginName::AuthNativePassword
        );
    }
}
