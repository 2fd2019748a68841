//! Turns one `COM_QUERY` payload into an operation tag plus a type bitmask.
//!
//! This is a pure function of the statement bytes: no SQL parser sits behind
//! it, only a small case-insensitive scanner over the leading keywords and a
//! handful of substring checks, which is all the routing decisions in this
//! proxy ever need. An embedded parser able to build a real AST is someone
//! else's concern; this module only ever depends on its output shape, never
//! on its presence.

use bitflags::bitflags;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ               = 1 << 0;
        const WRITE               = 1 << 1;
        const SESSION_WRITE       = 1 << 2;
        const USERVAR_READ        = 1 << 3;
        const USERVAR_WRITE       = 1 << 4;
        const SYSVAR_READ         = 1 << 5;
        const GSYSVAR_READ        = 1 << 6;
        const GSYSVAR_WRITE       = 1 << 7;
        const MASTER_READ         = 1 << 8;
        const BEGIN_TRX           = 1 << 9;
        const COMMIT              = 1 << 10;
        const ROLLBACK            = 1 << 11;
        const ENABLE_AUTOCOMMIT   = 1 << 12;
        const DISABLE_AUTOCOMMIT  = 1 << 13;
        const CREATE_TMP_TABLE    = 1 << 14;
        const READ_TMP_TABLE      = 1 << 15;
        const PREPARE_STMT        = 1 << 16;
        const EXEC_STMT           = 1 << 17;
        const DEALLOC_PREPARE     = 1 << 18;
        const NEXT_TRX            = 1 << 19;
        const READONLY            = 1 << 20;
        const READWRITE           = 1 << 21;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    ChangeDb,
    Set,
    SetTransaction,
    Kill,
    Call,
    Begin,
    Commit,
    Rollback,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillHardness {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillKind {
    Connection,
    Query,
    QueryId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Id(u64),
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillInfo {
    pub hardness: KillHardness,
    pub kind: KillKind,
    pub target: KillTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub op: OpCode,
    pub type_mask: TypeMask,
    pub kill_info: Option<KillInfo>,
    pub multi_statement: bool,
}

/// Error returned for statements the classifier refuses outright (as opposed
/// to statements it merely can't interpret precisely, which fall back to
/// `OpCode::Other`).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("KILL QUERY ID does not accept a USER target")]
    KillQueryIdWithUserTarget,
}

fn cache() -> &'static Mutex<LruCache<String, Result<Classification, ClassifyError>>> {
    static CACHE: OnceLock<Mutex<LruCache<String, Result<Classification, ClassifyError>>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(LruCache::new(NonZeroUsize::new(4096).unwrap())))
}

/// Classifies a `COM_QUERY` payload, consulting a bounded LRU cache keyed by
/// the exact SQL text first.
pub fn classify(sql: &[u8]) -> Result<Classification, ClassifyError> {
    let text = String::from_utf8_lossy(sql).into_owned();
    if let Some(hit) = cache().lock().get(&text) {
        return hit.clone();
    }
    let result = classify_uncached(&text);
    cache().lock().put(text, result.clone());
    result
}

fn classify_uncached(sql: &str) -> Result<Classification, ClassifyError> {
    let trimmed = sql.trim_start();
    let upper_first_word = first_word_upper(trimmed);
    let multi_statement = has_second_top_level_statement(trimmed);

    let mut classification = match upper_first_word.as_str() {
        "SELECT" => classify_select(trimmed)?,
        "INSERT" => simple(OpCode::Insert, TypeMask::WRITE),
        "UPDATE" => simple(OpCode::Update, TypeMask::WRITE),
        "DELETE" => simple(OpCode::Delete, TypeMask::WRITE),
        "CREATE" if contains_word(trimmed, "TEMPORARY") => {
            simple(OpCode::CreateTable, TypeMask::WRITE | TypeMask::CREATE_TMP_TABLE)
        }
        "CREATE" => simple(OpCode::CreateTable, TypeMask::WRITE),
        "DROP" => simple(OpCode::DropTable, TypeMask::WRITE),
        "USE" => simple(OpCode::ChangeDb, TypeMask::SESSION_WRITE),
        "SET" => classify_set(trimmed),
        "BEGIN" => simple(OpCode::Begin, TypeMask::BEGIN_TRX),
        "START" if contains_word(trimmed, "TRANSACTION") => {
            simple(OpCode::Begin, TypeMask::BEGIN_TRX)
        }
        "COMMIT" => simple(OpCode::Commit, TypeMask::COMMIT),
        "ROLLBACK" => simple(OpCode::Rollback, TypeMask::ROLLBACK),
        "KILL" => classify_kill(trimmed)?,
        "CALL" => simple(OpCode::Call, TypeMask::WRITE),
        _ => simple(OpCode::Other, TypeMask::READ),
    };
    classification.multi_statement = multi_statement;
    Ok(classification)
}

fn simple(op: OpCode, type_mask: TypeMask) -> Classification {
    Classification { op, type_mask, kill_info: None, multi_statement: false }
}

fn first_word_upper(sql: &str) -> String {
    sql.split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn contains_word(sql: &str, word: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_') == word)
}

fn contains_ci(sql: &str, needle: &str) -> bool {
    sql.to_ascii_uppercase().contains(&needle.to_ascii_uppercase())
}

fn classify_select(sql: &str) -> Result<Classification, ClassifyError> {
    let mut mask = TypeMask::READ;
    if contains_ci(sql, "FOR UPDATE")
        || contains_ci(sql, "LOCK IN SHARE MODE")
        || contains_ci(sql, "INTO OUTFILE")
        || contains_ci(sql, "INTO DUMPFILE")
        || contains_ci(sql, "NEXTVAL")
        || contains_ci(sql, "NEXT VALUE FOR")
        || contains_ci(sql, ".NEXTVAL")
        || contains_ci(sql, "GET_LOCK")
        || contains_ci(sql, "RELEASE_LOCK")
        || contains_ci(sql, "IS_FREE_LOCK")
        || contains_ci(sql, "IS_USED_LOCK")
    {
        mask |= TypeMask::WRITE;
    }
    if contains_ci(sql, "LAST_INSERT_ID")
        || contains_ci(sql, "@@IDENTITY")
        || contains_ci(sql, "@@LAST_INSERT_ID")
        || contains_ci(sql, "@@LAST_GTID")
    {
        mask |= TypeMask::MASTER_READ;
    }
    if contains_ci(sql, "@@") {
        mask |= TypeMask::SYSVAR_READ;
    }
    if sql.contains('@') && !contains_ci(sql, "@@") {
        mask |= TypeMask::USERVAR_READ;
    }
    Ok(simple(OpCode::Select, mask))
}

fn classify_set(sql: &str) -> Classification {
    let upper = sql.to_ascii_uppercase();
    let rest = upper.strip_prefix("SET").unwrap_or("").trim_start();

    if rest.starts_with("GLOBAL") && rest.contains("TRANSACTION") {
        let mut mask = TypeMask::GSYSVAR_WRITE;
        if contains_ci(sql, "READ ONLY") {
            mask |= TypeMask::READONLY;
        } else if contains_ci(sql, "READ WRITE") {
            mask |= TypeMask::READWRITE;
        }
        return simple(OpCode::SetTransaction, mask);
    }
    if rest.contains("TRANSACTION")
        && (rest.starts_with("SESSION") || !rest.starts_with("GLOBAL"))
    {
        let mut mask = TypeMask::NEXT_TRX;
        if contains_ci(sql, "READ ONLY") {
            mask |= TypeMask::READONLY;
        } else if contains_ci(sql, "READ WRITE") {
            mask |= TypeMask::READWRITE;
        }
        return simple(OpCode::SetTransaction, mask);
    }

    if is_autocommit_assignment(rest, true) {
        return simple(
            OpCode::Set,
            TypeMask::SESSION_WRITE | TypeMask::ENABLE_AUTOCOMMIT | TypeMask::COMMIT,
        );
    }
    if is_autocommit_assignment(rest, false) {
        return simple(
            OpCode::Set,
            TypeMask::SESSION_WRITE | TypeMask::BEGIN_TRX | TypeMask::DISABLE_AUTOCOMMIT,
        );
    }

    let mut mask = TypeMask::empty();
    if rest.starts_with("GLOBAL") {
        mask |= TypeMask::GSYSVAR_WRITE;
    } else {
        mask |= TypeMask::SESSION_WRITE;
    }
    if sql.contains('@') && !contains_ci(sql, "@@") {
        mask |= TypeMask::USERVAR_WRITE;
    }
    simple(OpCode::Set, mask)
}

fn is_autocommit_assignment(rest: &str, enable: bool) -> bool {
    let no_space: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    let candidates_on = ["AUTOCOMMIT=1", "AUTOCOMMIT=TRUE", "AUTOCOMMIT:=1"];
    let candidates_off = ["AUTOCOMMIT=0", "AUTOCOMMIT=FALSE", "AUTOCOMMIT:=0"];
    let candidates = if enable { &candidates_on } else { &candidates_off };
    candidates.iter().any(|c| no_space.starts_with(c))
}

fn classify_kill(sql: &str) -> Result<Classification, ClassifyError> {
    let upper = sql.to_ascii_uppercase();
    let rest = upper.strip_prefix("KILL").unwrap_or("").trim_start();

    let (hardness, rest) = if let Some(r) = rest.strip_prefix("HARD") {
        (KillHardness::Hard, r.trim_start())
    } else if let Some(r) = rest.strip_prefix("SOFT") {
        (KillHardness::Soft, r.trim_start())
    } else {
        (KillHardness::Hard, rest)
    };

    let (kind, rest) = if let Some(r) = rest.strip_prefix("QUERY ID") {
        (KillKind::QueryId, r.trim_start())
    } else if let Some(r) = rest.strip_prefix("QUERY") {
        (KillKind::Query, r.trim_start())
    } else if let Some(r) = rest.strip_prefix("CONNECTION") {
        (KillKind::Connection, r.trim_start())
    } else {
        (KillKind::Connection, rest)
    };

    let target = if let Some(r) = rest.strip_prefix("USER") {
        if kind == KillKind::QueryId {
            return Err(ClassifyError::KillQueryIdWithUserTarget);
        }
        KillTarget::User(r.trim().trim_matches('\'').to_string())
    } else {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        KillTarget::Id(digits.parse().unwrap_or(0))
    };

    Ok(Classification {
        op: OpCode::Kill,
        type_mask: TypeMask::WRITE,
        kill_info: Some(KillInfo { hardness, kind, target }),
        multi_statement: false,
    })
}

/// A second top-level statement after a `;` marks the buffer multi-statement,
/// unless the `;` falls inside a string literal, a comment, or a
/// `BEGIN NOT ATOMIC ... END` block.
fn has_second_top_level_statement(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut begin_depth: i32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            if c == '*' && bytes.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if in_single_quote {
            if c == '\'' && bytes.get(i + 1) != Some(&b'\'') {
                in_single_quote = false;
            } else if c == '\'' {
                i += 1;
            }
            i += 1;
            continue;
        }
        if in_double_quote {
            if c == '"' && bytes.get(i + 1) != Some(&b'"') {
                in_double_quote = false;
            } else if c == '"' {
                i += 1;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => in_single_quote = true,
            '"' => in_double_quote = true,
            '-' if bytes.get(i + 1) == Some(&b'-') => in_line_comment = true,
            '/' if bytes.get(i + 1) == Some(&b'*') => in_block_comment = true,
            ';' => {
                if begin_depth == 0 {
                    let trailing = sql[i + 1..].trim();
                    if !trailing.is_empty() {
                        return true;
                    }
                }
            }
            _ => {}
        }
        if sql[i..].to_ascii_uppercase().starts_with("BEGIN") {
            begin_depth += 1;
        } else if sql[i..].to_ascii_uppercase().starts_with("END") {
            begin_depth = (begin_depth - 1).max(0);
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_is_read() {
        let c = classify(b"SELECT 1").unwrap();
        assert_eq!(c.type_mask, TypeMask::READ);
    }

    #[test]
    fn select_for_update_is_read_and_write() {
        let c = classify(b"SELECT * FROM t FOR UPDATE").unwrap();
        assert!(c.type_mask.contains(TypeMask::READ));
        assert!(c.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn select_last_insert_id_is_master_read() {
        let c = classify(b"SELECT LAST_INSERT_ID()").unwrap();
        assert!(c.type_mask.contains(TypeMask::MASTER_READ));
    }

    #[test]
    fn autocommit_enable_is_commit_like() {
        let c = classify(b"SET autocommit=1").unwrap();
        assert!(c.type_mask.contains(TypeMask::SESSION_WRITE));
        assert!(c.type_mask.contains(TypeMask::ENABLE_AUTOCOMMIT));
        assert!(c.type_mask.contains(TypeMask::COMMIT));
    }

    #[test]
    fn autocommit_disable_begins_a_transaction() {
        let c = classify(b"SET autocommit=0").unwrap();
        assert!(c.type_mask.contains(TypeMask::BEGIN_TRX));
        assert!(c.type_mask.contains(TypeMask::DISABLE_AUTOCOMMIT));
    }

    #[test]
    fn set_global_is_not_session_write() {
        let c = classify(b"SET GLOBAL max_connections=200").unwrap();
        assert!(c.type_mask.contains(TypeMask::GSYSVAR_WRITE));
        assert!(!c.type_mask.contains(TypeMask::SESSION_WRITE));
    }

    #[test]
    fn begin_and_commit_are_tagged() {
        assert!(classify(b"BEGIN").unwrap().type_mask.contains(TypeMask::BEGIN_TRX));
        assert!(classify(b"START TRANSACTION").unwrap().type_mask.contains(TypeMask::BEGIN_TRX));
        assert!(classify(b"COMMIT").unwrap().type_mask.contains(TypeMask::COMMIT));
        assert!(classify(b"ROLLBACK").unwrap().type_mask.contains(TypeMask::ROLLBACK));
    }

    #[test]
    fn use_db_is_change_db_and_session_write() {
        let c = classify(b"USE mydb").unwrap();
        assert_eq!(c.op, OpCode::ChangeDb);
        assert!(c.type_mask.contains(TypeMask::SESSION_WRITE));
    }

    #[test]
    fn create_temporary_table_is_tagged() {
        let c = classify(b"CREATE TEMPORARY TABLE t (id int)").unwrap();
        assert!(c.type_mask.contains(TypeMask::WRITE));
        assert!(c.type_mask.contains(TypeMask::CREATE_TMP_TABLE));
    }

    #[test]
    fn kill_query_id_rejects_user_target() {
        let err = classify(b"KILL QUERY ID USER 'bob'").unwrap_err();
        assert_eq!(err, ClassifyError::KillQueryIdWithUserTarget);
    }

    #[test]
    fn kill_connection_parses_numeric_target() {
        let c = classify(b"KILL 42").unwrap();
        let info = c.kill_info.unwrap();
        assert_eq!(info.kind, KillKind::Connection);
        assert_eq!(info.target, KillTarget::Id(42));
    }

    #[test]
    fn multi_statement_detection_ignores_semicolons_in_strings() {
        let c = classify(b"SELECT ';' FROM t").unwrap();
        assert!(!c.multi_statement);
        let c = classify(b"SELECT 1; SELECT 2").unwrap();
        assert!(c.multi_statement);
        assert_eq!(c.op, OpCode::Select);
    }
}
