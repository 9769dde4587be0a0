use thiserror::Error;

/// Errors produced while decoding or encoding wire frames.
///
/// Kept distinct from `serde_json::Error` so callers can tell a malformed
/// payload apart from a well-formed one carrying a `type` we don't know
/// about.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown control message type: {0}")]
    UnknownType(String),

    #[error("invalid binary frame: {reason}")]
    InvalidBinaryFrame { reason: &'static str },

    #[error("shell_id is {0} bytes, exceeds the 255-byte wire limit")]
    ShellIdTooLong(usize),
}

/// The taxonomy of error codes carried in `error.code` and
/// `auth_failed.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidMessage,
    InvalidCode,
    ExpiredCode,
    AlreadyJoined,
    UpstreamGone,
    SlowConsumer,
    Internal,
}

impl ErrorKind {
    pub fn as_code(self) -> &'static str {
        match self {
            ErrorKind::InvalidMessage => "INVALID_MESSAGE",
            ErrorKind::InvalidCode => "INVALID_CODE",
            ErrorKind::ExpiredCode => "EXPIRED_CODE",
            ErrorKind::AlreadyJoined => "ALREADY_JOINED",
            ErrorKind::UpstreamGone => "UPSTREAM_GONE",
            ErrorKind::SlowConsumer => "SLOW_CONSUMER",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_codes_match_taxonomy() {
        assert_eq!(ErrorKind::InvalidMessage.as_code(), "INVALID_MESSAGE");
        assert_eq!(ErrorKind::UpstreamGone.as_code(), "UPSTREAM_GONE");
        assert_eq!(ErrorKind::SlowConsumer.as_code(), "SLOW_CONSUMER");
    }
}
