//! MySQL/MariaDB error numbers and SQLSTATE strings the proxy emits.
//!
//! Only the codes the proxy itself raises are enumerated (see the error
//! handling kinds in the design notes); codes returned verbatim from a
//! backend are forwarded as-is and never reconstructed here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_NO_DB_ERROR = 1046,
    ER_TOO_MANY_USER_CONNECTIONS = 1040,
    ER_CONNECTION_KILLED = 1927,
    ER_SERVER_GONE_ERROR = 2006,
    ER_PROTOCOL_VERSION_MISMATCH = 2007,
    ER_HANDSHAKE_ERROR = 1043,
}

impl ErrorKind {
    /// 5-character SQLSTATE associated with this error number.
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_NO_DB_ERROR => b"3D000",
            ErrorKind::ER_TOO_MANY_USER_CONNECTIONS => b"08004",
            ErrorKind::ER_CONNECTION_KILLED => b"70100",
            ErrorKind::ER_SERVER_GONE_ERROR => b"HY000",
            ErrorKind::ER_PROTOCOL_VERSION_MISMATCH => b"08001",
            ErrorKind::ER_HANDSHAKE_ERROR => b"08S01",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR => "Access denied",
            ErrorKind::ER_NO_DB_ERROR => "No database selected",
            ErrorKind::ER_TOO_MANY_USER_CONNECTIONS => "Too many connections",
            ErrorKind::ER_CONNECTION_KILLED => "Connection was killed",
            ErrorKind::ER_SERVER_GONE_ERROR => "MySQL server has gone away",
            ErrorKind::ER_PROTOCOL_VERSION_MISMATCH => "Protocol version mismatch",
            ErrorKind::ER_HANDSHAKE_ERROR => "Bad handshake",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_is_five_bytes() {
        assert_eq!(ErrorKind::ER_ACCESS_DENIED_ERROR.sqlstate().len(), 5);
        assert_eq!(ErrorKind::ER_SERVER_GONE_ERROR.sqlstate().len(), 5);
    }
}
