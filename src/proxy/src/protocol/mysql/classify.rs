//! Lightweight statement classification ahead of forwarding.
//!
//! The router only parses far enough to notice constructs that make a
//! session unshareable and to intercept its own control statements. The
//! scan is conservative: statements it cannot make sense of taint the
//! session rather than pass as harmless.

use bitflags::bitflags;
use winnow::ascii::{multispace0, multispace1, Caseless};
use winnow::combinator::{alt, delimited, opt, preceded};
use winnow::prelude::*;

bitflags! {
    /// Sticky per-session taints. Only COM_RESET_CONNECTION or
    /// COM_CHANGE_USER clear them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionTaint: u32 {
        const LOCK_TABLES = 1 << 0;
        const GET_LOCK = 1 << 1;
        const SERVICE_LOCK = 1 << 2;
        const TEMP_TABLE = 1 << 3;
        const SQL_CALC_FOUND_ROWS = 1 << 4;
        const FLUSH_WITH_READ_LOCK = 1 << 5;
        const TEXT_PREPARE = 1 << 6;
        const LOCK_INSTANCE = 1 << 7;
        const SELECT_INTO_VAR = 1 << 8;
        const USER_VARIABLE = 1 << 9;
        const UNPARSEABLE = 1 << 10;
    }
}

/// Statement shapes the command pipeline reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Set,
    Use,
    ShowWarnings,
    ShowWarningCount,
    /// `ROUTER SET <name> = <value>`, intercepted and never forwarded
    RouterSet(RouterSet),
    Begin,
    Commit,
    Rollback,
    Other,
}

/// Parsed form of the intercepted `ROUTER SET` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSet {
    Trace(bool),
    /// recognizably `ROUTER ...` but not a statement we accept
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementClassification {
    pub kind: StatementKind,
    pub taints: SessionTaint,
    pub is_multi_statement: bool,
}

impl StatementClassification {
    pub fn blocks_sharing(&self) -> bool {
        !self.taints.is_empty()
    }
}

/// Normalized token: an identifier/keyword (uppercased), a user variable
/// (leading `@` kept), or one byte of punctuation.
#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Punct(u8),
}

/// Tokenize just enough SQL: skips whitespace, `--`/`#` line comments,
/// `/* */` block comments, string literals and backtick identifiers.
fn tokenize(sql: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < sql.len() {
        let b = sql[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'#' => {
                while i < sql.len() && sql[i] != b'\n' {
                    i += 1;
                }
            }
            b'-' if sql.get(i + 1) == Some(&b'-') => {
                while i < sql.len() && sql[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if sql.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < sql.len() && !(sql[i] == b'*' && sql[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(sql.len());
            }
            b'\'' | b'"' | b'`' => {
                let quote = b;
                i += 1;
                while i < sql.len() {
                    if sql[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if sql[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                // the literal's content is irrelevant for classification
                tokens.push(Token::Punct(quote));
            }
            b'@' | b'_' | b'$' | b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < sql.len()
                    && matches!(sql[i],
                        b'_' | b'$' | b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'@')
                {
                    i += 1;
                }
                let word = String::from_utf8_lossy(&sql[start..i]).to_ascii_uppercase();
                tokens.push(Token::Word(word));
            }
            _ => {
                tokens.push(Token::Punct(b));
                i += 1;
            }
        }
    }

    tokens
}

fn word_at(tokens: &[Token], idx: usize) -> Option<&str> {
    match tokens.get(idx) {
        Some(Token::Word(w)) => Some(w.as_str()),
        _ => None,
    }
}

/// `ROUTER SET trace = {0|1}`, case-insensitive.
fn router_set_statement(input: &mut &str) -> winnow::PResult<RouterSet> {
    preceded(
        (multispace0, Caseless("router"), multispace1),
        alt((
            delimited(
                (
                    Caseless("set"),
                    multispace1,
                    Caseless("trace"),
                    multispace0,
                    '=',
                    multispace0,
                ),
                alt(('0'.value(false), '1'.value(true))),
                (multispace0, opt(';'), multispace0),
            )
            .map(RouterSet::Trace),
            winnow::token::rest.value(RouterSet::Malformed),
        )),
    )
    .parse_next(input)
}

/// Recognize `ROUTER ...` statements. `None` means the statement is not
/// router-addressed at all.
pub fn parse_router_set(sql: &[u8]) -> Option<RouterSet> {
    let text = std::str::from_utf8(sql).ok()?;
    let trimmed = text.trim_start();
    if !trimmed
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("router"))
        .unwrap_or(false)
    {
        return None;
    }
    // "ROUTERS" and friends are ordinary identifiers
    match trimmed.as_bytes().get(6) {
        None => return Some(RouterSet::Malformed),
        Some(c) if !c.is_ascii_whitespace() => return None,
        Some(_) => {}
    }
    let mut input = text;
    match router_set_statement.parse_next(&mut input) {
        Ok(parsed) if input.trim().is_empty() => Some(parsed),
        Ok(_) | Err(_) => Some(RouterSet::Malformed),
    }
}

pub fn classify_statement(sql: &[u8]) -> StatementClassification {
    if let Some(router_set) = parse_router_set(sql) {
        return StatementClassification {
            kind: StatementKind::RouterSet(router_set),
            taints: SessionTaint::empty(),
            is_multi_statement: false,
        };
    }

    let tokens = tokenize(sql);
    let mut taints = SessionTaint::empty();

    let first = word_at(&tokens, 0);
    let second = word_at(&tokens, 1);

    let kind = match (first, second) {
        (Some("SELECT"), _) => StatementKind::Select,
        (Some("SET"), _) => StatementKind::Set,
        (Some("USE"), _) => StatementKind::Use,
        (Some("SHOW"), Some("WARNINGS")) => StatementKind::ShowWarnings,
        (Some("SHOW"), Some("COUNT")) => StatementKind::ShowWarningCount,
        (Some("BEGIN"), _) => StatementKind::Begin,
        (Some("START"), Some("TRANSACTION")) => StatementKind::Begin,
        (Some("COMMIT"), _) => StatementKind::Commit,
        (Some("ROLLBACK"), _) => StatementKind::Rollback,
        (Some(_), _) => StatementKind::Other,
        (None, _) => {
            return StatementClassification {
                kind: StatementKind::Other,
                taints: SessionTaint::UNPARSEABLE,
                is_multi_statement: false,
            }
        }
    };

    match (first, second) {
        (Some("LOCK"), Some("TABLES")) | (Some("LOCK"), Some("TABLE")) => {
            taints |= SessionTaint::LOCK_TABLES;
        }
        (Some("LOCK"), Some("INSTANCE")) => {
            taints |= SessionTaint::LOCK_INSTANCE;
        }
        (Some("CREATE"), Some("TEMPORARY")) => {
            taints |= SessionTaint::TEMP_TABLE;
        }
        (Some("PREPARE"), _) => {
            taints |= SessionTaint::TEXT_PREPARE;
        }
        (Some("FLUSH"), _) => {
            let has_read_lock = tokens.windows(2).any(|pair| {
                matches!(
                    pair,
                    [Token::Word(a), Token::Word(b)]
                        if a == "READ" && b == "LOCK"
                )
            });
            if has_read_lock {
                taints |= SessionTaint::FLUSH_WITH_READ_LOCK;
            }
        }
        _ => {}
    }

    let mut statement_done = false;
    let mut is_multi_statement = false;
    for (idx, token) in tokens.iter().enumerate() {
        if statement_done {
            is_multi_statement = true;
            break;
        }
        match token {
            Token::Punct(b';') => statement_done = true,
            Token::Word(word) => {
                if word == "SQL_CALC_FOUND_ROWS" {
                    taints |= SessionTaint::SQL_CALC_FOUND_ROWS;
                }
                if word == "GET_LOCK" {
                    taints |= SessionTaint::GET_LOCK;
                }
                if word.starts_with("SERVICE_GET_") && word.ends_with("_LOCKS") {
                    taints |= SessionTaint::SERVICE_LOCK;
                }
                if word.starts_with('@') && !word.starts_with("@@") {
                    // user variables make results session-scoped
                    taints |= match (kind.clone(), word_at(&tokens, idx.wrapping_sub(1))) {
                        (StatementKind::Select, Some("INTO")) => SessionTaint::SELECT_INTO_VAR,
                        _ => SessionTaint::USER_VARIABLE,
                    };
                }
            }
            _ => {}
        }
    }

    StatementClassification {
        kind,
        taints,
        is_multi_statement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> StatementClassification {
        classify_statement(sql.as_bytes())
    }

    #[test]
    fn plain_select_is_clean() {
        let c = classify("SELECT 1");
        assert_eq!(c.kind, StatementKind::Select);
        assert!(c.taints.is_empty());
        assert!(!c.is_multi_statement);
    }

    #[test]
    fn router_set_trace_parses() {
        assert_eq!(
            parse_router_set(b"ROUTER SET trace = 1"),
            Some(RouterSet::Trace(true))
        );
        assert_eq!(
            parse_router_set(b"router set TRACE=0;"),
            Some(RouterSet::Trace(false))
        );
        assert_eq!(
            parse_router_set(b"ROUTER SET trace = 2"),
            Some(RouterSet::Malformed)
        );
        assert_eq!(
            parse_router_set(b"ROUTER GET trace"),
            Some(RouterSet::Malformed)
        );
        assert_eq!(parse_router_set(b"SELECT 1"), None);
        // not a prefix match: ROUTERS is an ordinary identifier
        assert_eq!(parse_router_set(b"ROUTERSET"), None);
    }

    #[test]
    fn lock_tables_taints() {
        let c = classify("LOCK TABLES t READ");
        assert!(c.taints.contains(SessionTaint::LOCK_TABLES));
        let c = classify("lock table t write");
        assert!(c.taints.contains(SessionTaint::LOCK_TABLES));
        assert!(classify("UNLOCK TABLES").taints.is_empty());
    }

    #[test]
    fn lock_instance_taints() {
        let c = classify("LOCK INSTANCE FOR BACKUP");
        assert!(c.taints.contains(SessionTaint::LOCK_INSTANCE));
    }

    #[test]
    fn get_lock_taints() {
        let c = classify("SELECT GET_LOCK('x', 10)");
        assert!(c.taints.contains(SessionTaint::GET_LOCK));
        let c = classify("SELECT SERVICE_GET_WRITE_LOCKS('ns', 'n', 10)");
        assert!(c.taints.contains(SessionTaint::SERVICE_LOCK));
    }

    #[test]
    fn temp_table_taints() {
        let c = classify("CREATE TEMPORARY TABLE tmp (id INT)");
        assert!(c.taints.contains(SessionTaint::TEMP_TABLE));
        assert!(classify("CREATE TABLE t (id INT)").taints.is_empty());
    }

    #[test]
    fn sql_calc_found_rows_taints() {
        let c = classify("SELECT SQL_CALC_FOUND_ROWS * FROM t LIMIT 1");
        assert!(c.taints.contains(SessionTaint::SQL_CALC_FOUND_ROWS));
    }

    #[test]
    fn flush_with_read_lock_taints() {
        let c = classify("FLUSH TABLES t1, t2 WITH READ LOCK");
        assert!(c.taints.contains(SessionTaint::FLUSH_WITH_READ_LOCK));
        assert!(classify("FLUSH PRIVILEGES").taints.is_empty());
    }

    #[test]
    fn text_prepare_taints() {
        let c = classify("PREPARE s FROM 'SELECT 1'");
        assert!(c.taints.contains(SessionTaint::TEXT_PREPARE));
    }

    #[test]
    fn user_variables_taint() {
        let c = classify("SELECT @x");
        assert!(c.taints.contains(SessionTaint::USER_VARIABLE));
        let c = classify("SELECT 1 INTO @x");
        assert!(c.taints.contains(SessionTaint::SELECT_INTO_VAR));
        let c = classify("SET @x := 5");
        assert!(c.taints.contains(SessionTaint::USER_VARIABLE));
        // system variables are tracked, not tainting
        assert!(classify("SELECT @@port").taints.is_empty());
    }

    #[test]
    fn literals_and_comments_do_not_taint() {
        assert!(classify("SELECT 'GET_LOCK(1)'").taints.is_empty());
        assert!(classify("SELECT 1 /* GET_LOCK */").taints.is_empty());
        assert!(classify("SELECT 1 -- @x").taints.is_empty());
    }

    #[test]
    fn multi_statement_detected() {
        let c = classify("SELECT 1; SELECT 2");
        assert!(c.is_multi_statement);
        // trailing semicolon alone is not a multi-statement
        let c = classify("SELECT 1;");
        assert!(!c.is_multi_statement);
    }

    #[test]
    fn show_warnings_kinds() {
        assert_eq!(classify("SHOW WARNINGS").kind, StatementKind::ShowWarnings);
        assert_eq!(
            classify("show count(*) warnings").kind,
            StatementKind::ShowWarningCount
        );
    }

    #[test]
    fn empty_statement_is_conservatively_tainted() {
        let c = classify("   ");
        assert!(c.taints.contains(SessionTaint::UNPARSEABLE));
    }
}
