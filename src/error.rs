//! Error types: user-visible reply errors and connection-level failures

use thiserror::Error;

/// A typed error reply. The `Display` text is the exact wire message (the
/// protocol layer prepends `-` and appends CRLF), so the first word is
/// the error class clients switch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR offset is out of range")]
    OffsetOutOfRange,

    #[error("ERR DB index is out of range")]
    DbIndexOutOfRange,

    #[error("ERR invalid cursor")]
    InvalidCursor,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR increment would produce NaN or Infinity")]
    NanOrInfinity,

    #[error("ERR no such key")]
    NoKey,

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    #[error("LOADING server is loading the dataset in memory")]
    Loading,

    #[error("ERR {0}")]
    Message(String),
}

impl ReplyError {
    pub fn message(text: impl Into<String>) -> Self {
        ReplyError::Message(text.into())
    }
}

/// Connection and framing failures; these close the connection rather
/// than produce a reply.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_text() {
        assert_eq!(
            ReplyError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
        assert_eq!(
            ReplyError::Arity("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert_eq!(
            ReplyError::ExecAbort.to_string(),
            "EXECABORT Transaction discarded because of previous errors."
        );
        assert_eq!(ReplyError::message("custom").to_string(), "ERR custom");
    }
}
