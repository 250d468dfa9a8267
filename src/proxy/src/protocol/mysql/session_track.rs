//! Session-state tracking.
//!
//! The server reports state changes in OK/EOF packets when the
//! `session_track` capability is shared. The tracker folds those reports
//! into a per-backend-session record and owns the predicate that decides
//! whether the session may be returned to the pool.

use crate::protocol::mysql::classify::{SessionTaint, StatementClassification};
use crate::protocol::mysql::codec::server::Ok as OkPacket;
use crate::protocol::mysql::codec::{CodecError, CodecResult, DecodeBuf};
use crate::protocol::mysql::constants::SessionStateType;

use hashbrown::HashMap;
use num_traits::FromPrimitive;
use tracing::trace;

const TRX_STATE_IDLE: [u8; 8] = *b"________";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InReadOnlyTransaction,
    LockedTables,
}

/// Per-backend-session record of everything the router must know to hand
/// the session to another client or to rebuild it on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTracker {
    schema: Option<String>,
    system_variables: HashMap<String, String>,
    trx_state: [u8; 8],
    trx_characteristics: Option<String>,
    gtids: Option<String>,
    taints: SessionTaint,
    open_prepared_statements: u32,
    open_cursors: u32,
    multi_statement_mode: bool,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self {
            schema: None,
            system_variables: HashMap::new(),
            trx_state: TRX_STATE_IDLE,
            trx_characteristics: None,
            gtids: None,
            taints: SessionTaint::empty(),
            open_prepared_statements: 0,
            open_cursors: 0,
            multi_statement_mode: false,
        }
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn system_variables(&self) -> &HashMap<String, String> {
        &self.system_variables
    }

    pub fn gtids(&self) -> Option<&str> {
        self.gtids.as_deref()
    }

    pub fn taints(&self) -> SessionTaint {
        self.taints
    }

    /// Fold the session-state-change payload of an OK/EOF packet in.
    pub fn observe_ok(&mut self, ok: &OkPacket<'_>) -> CodecResult<()> {
        if ok.session_changes.is_empty() {
            return Ok(());
        }
        self.observe_session_changes(&ok.session_changes)
    }

    /// Parse a `session_state_info` payload: a sequence of
    /// `{VarInt type, VarString data}` records.
    pub fn observe_session_changes(&mut self, data: &[u8]) -> CodecResult<()> {
        let mut dec = DecodeBuf::new(data);

        while !dec.is_empty() {
            let record_type = dec.var_int()?;
            let record = dec.var_bytes()?;

            match SessionStateType::from_u64(record_type) {
                Some(SessionStateType::SystemVariables) => {
                    let mut rec = DecodeBuf::new(record);
                    let name = rec.var_bytes()?;
                    let value = rec.var_bytes()?;
                    self.system_variables.insert(
                        String::from_utf8_lossy(name).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
                Some(SessionStateType::Schema) => {
                    let mut rec = DecodeBuf::new(record);
                    let schema = rec.var_bytes()?;
                    self.schema = Some(String::from_utf8_lossy(schema).into_owned());
                }
                Some(SessionStateType::StateChange) => {
                    // "1" when something not otherwise reported changed
                }
                Some(SessionStateType::Gtids) => {
                    let mut rec = DecodeBuf::new(record);
                    let gtids = rec.var_bytes()?;
                    self.gtids = Some(String::from_utf8_lossy(gtids).into_owned());
                }
                Some(SessionStateType::TransactionCharacteristics) => {
                    let mut rec = DecodeBuf::new(record);
                    let characteristics = rec.var_bytes()?;
                    self.trx_characteristics = if characteristics.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(characteristics).into_owned())
                    };
                }
                Some(SessionStateType::TransactionState) => {
                    let mut rec = DecodeBuf::new(record);
                    let state = rec.var_bytes()?;
                    if state.len() != 8 {
                        return Err(CodecError::InvalidInput);
                    }
                    self.trx_state.copy_from_slice(state);
                }
                None => {
                    trace!("ignoring unknown session-state record type {record_type}");
                }
            }
        }

        Ok(())
    }

    /// Transaction status byte derived from the TRANSACTION_STATE report.
    ///
    /// The eight flag characters: trx-type, unsafe-read, read, unsafe-write,
    /// write, unsafe-stmt, resultset-sent, locked-tables.
    pub fn transaction_status(&self) -> TransactionStatus {
        if self.trx_state[7] == b'L' {
            return TransactionStatus::LockedTables;
        }
        if self.trx_state == TRX_STATE_IDLE {
            return TransactionStatus::Idle;
        }
        let wrote = self.trx_state[3] != b'_' || self.trx_state[4] != b'_';
        if wrote {
            TransactionStatus::InTransaction
        } else if self.trx_state[0] == b'_' {
            // statement flags without an open transaction
            TransactionStatus::Idle
        } else {
            TransactionStatus::InReadOnlyTransaction
        }
    }

    pub fn apply_classification(&mut self, classification: &StatementClassification) {
        self.taints |= classification.taints;
    }

    pub fn note_prepared_statement_opened(&mut self) {
        self.open_prepared_statements += 1;
    }

    pub fn note_prepared_statement_closed(&mut self) {
        self.open_prepared_statements = self.open_prepared_statements.saturating_sub(1);
    }

    pub fn note_cursor_opened(&mut self) {
        self.open_cursors += 1;
    }

    pub fn note_cursor_closed(&mut self) {
        self.open_cursors = self.open_cursors.saturating_sub(1);
    }

    /// COM_SET_OPTION toggles multi-statement mode.
    pub fn set_multi_statement_mode(&mut self, on: bool) {
        self.multi_statement_mode = on;
    }

    pub fn multi_statement_mode(&self) -> bool {
        self.multi_statement_mode
    }

    /// COM_RESET_CONNECTION / COM_CHANGE_USER wipe all session state
    /// server-side; mirror that.
    pub fn reset(&mut self) {
        *self = SessionTracker::default();
    }

    /// May this backend session be handed to another client right now?
    ///
    /// Conservative: any taint the classifier could not rule out keeps the
    /// session attached.
    pub fn sharable(&self) -> bool {
        self.transaction_status() == TransactionStatus::Idle
            && self.taints.is_empty()
            && self.open_prepared_statements == 0
            && self.open_cursors == 0
            && !self.multi_statement_mode
            && self.trx_characteristics.is_none()
    }

    /// Commands to replay on a fresh or reassigned backend so the session
    /// looks like the recorded one. The schema is restored separately via
    /// COM_INIT_DB.
    pub fn restoration_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .system_variables
            .iter()
            .map(|(name, value)| format!("SET @@SESSION.{} = {}", name, quote_value(value)))
            .collect();
        commands.sort();
        if let Some(characteristics) = &self.trx_characteristics {
            commands.push(characteristics.clone());
        }
        commands
    }
}

fn quote_value(value: &str) -> String {
    let is_numeric = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if is_numeric {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::classify::classify_statement;
    use crate::protocol::mysql::codec::wire::EncodeBuf;
    use mysql_common::constants::{CapabilityFlags, StatusFlags};
    use std::borrow::Cow;

    fn session_change_record(record_type: u8, fields: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for field in fields {
            let mut tmp = vec![0u8; 9 + field.len()];
            let mut enc = EncodeBuf::fixed(&mut tmp);
            enc.put_var_bytes(field).unwrap();
            let written = enc.written();
            body.extend_from_slice(&tmp[..written]);
        }
        let mut out = vec![0u8; 10 + body.len()];
        let mut enc = EncodeBuf::fixed(&mut out);
        enc.put_var_int(u64::from(record_type)).unwrap();
        enc.put_var_bytes(&body).unwrap();
        let written = enc.written();
        out.truncate(written);
        out
    }

    #[test]
    fn schema_change_updates_recorded_schema() {
        let mut tracker = SessionTracker::new();
        let changes = session_change_record(SessionStateType::Schema as u8, &[b"test"]);

        let ok = OkPacket {
            status_flags: StatusFlags::SERVER_SESSION_STATE_CHANGED,
            session_changes: Cow::Owned(changes),
            ..OkPacket::default()
        };
        tracker.observe_ok(&ok).unwrap();
        assert_eq!(tracker.schema(), Some("test"));
    }

    #[test]
    fn schema_change_through_codec_round_trip() {
        use crate::protocol::mysql::codec::MessageEncode;

        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;
        let changes = session_change_record(SessionStateType::Schema as u8, &[b"prod"]);
        let ok = OkPacket {
            status_flags: StatusFlags::SERVER_SESSION_STATE_CHANGED,
            session_changes: Cow::Owned(changes.clone()),
            ..OkPacket::default()
        };
        let bytes = ok.encode_to_vec(caps).unwrap();
        let (_, decoded) = OkPacket::decode(&bytes, caps).unwrap();
        assert_eq!(decoded.session_changes.as_ref(), &changes[..]);

        let mut tracker = SessionTracker::new();
        tracker.observe_ok(&decoded).unwrap();
        assert_eq!(tracker.schema(), Some("prod"));
    }

    #[test]
    fn system_variable_tracking_and_restoration() {
        let mut tracker = SessionTracker::new();
        let changes = session_change_record(
            SessionStateType::SystemVariables as u8,
            &[b"sql_mode", b"STRICT_TRANS_TABLES"],
        );
        tracker.observe_session_changes(&changes).unwrap();
        assert_eq!(
            tracker.system_variables().get("sql_mode").map(String::as_str),
            Some("STRICT_TRANS_TABLES")
        );
        assert_eq!(
            tracker.restoration_commands(),
            vec!["SET @@SESSION.sql_mode = 'STRICT_TRANS_TABLES'".to_string()]
        );
    }

    #[test]
    fn transaction_state_gates_sharing() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.sharable());

        let changes =
            session_change_record(SessionStateType::TransactionState as u8, &[b"T_______"]);
        tracker.observe_session_changes(&changes).unwrap();
        assert_eq!(
            tracker.transaction_status(),
            TransactionStatus::InReadOnlyTransaction
        );
        assert!(!tracker.sharable());

        let changes =
            session_change_record(SessionStateType::TransactionState as u8, &[b"T__W____"]);
        tracker.observe_session_changes(&changes).unwrap();
        assert_eq!(tracker.transaction_status(), TransactionStatus::InTransaction);

        let changes =
            session_change_record(SessionStateType::TransactionState as u8, &[b"________"]);
        tracker.observe_session_changes(&changes).unwrap();
        assert!(tracker.sharable());
    }

    #[test]
    fn locked_tables_state() {
        let mut tracker = SessionTracker::new();
        let changes =
            session_change_record(SessionStateType::TransactionState as u8, &[b"_______L"]);
        tracker.observe_session_changes(&changes).unwrap();
        assert_eq!(tracker.transaction_status(), TransactionStatus::LockedTables);
        assert!(!tracker.sharable());
    }

    #[test]
    fn taint_blocks_sharing_until_reset() {
        let mut tracker = SessionTracker::new();
        tracker.apply_classification(&classify_statement(b"LOCK TABLES t READ"));
        assert!(!tracker.sharable());

        // a later clean statement does not clear the taint
        tracker.apply_classification(&classify_statement(b"SELECT 1"));
        assert!(!tracker.sharable());

        tracker.reset();
        assert!(tracker.sharable());
    }

    #[test]
    fn prepared_statements_block_sharing() {
        let mut tracker = SessionTracker::new();
        tracker.note_prepared_statement_opened();
        assert!(!tracker.sharable());
        tracker.note_prepared_statement_closed();
        assert!(tracker.sharable());
    }

    #[test]
    fn quoting_of_restored_values() {
        assert_eq!(quote_value("42"), "42");
        assert_eq!(quote_value("-1.5"), "-1.5");
        assert_eq!(quote_value("O'Neil"), "'O''Neil'");
        assert_eq!(quote_value("REPEATABLE-READ"), "'REPEATABLE-READ'");
    }
}
