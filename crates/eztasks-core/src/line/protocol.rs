//! Record classification for the relay protocol.

/// First line an executor sends to claim the executor slot.
pub const EXECUTOR_HANDSHAKE: &str = "executor";

/// Prefix of executor liveness records.
pub const HEARTBEAT_PREFIX: &str = "heartbeat::";

/// How a connection identified itself with its first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opening {
    /// Wants to become the executor.
    Executor,
    /// Ordinary client; the first record is already payload.
    Client,
}

impl Opening {
    /// Classify a connection by its first record. Only an exact match claims
    /// the executor slot.
    pub fn classify(first: &str) -> Self {
        if first == EXECUTOR_HANDSHAKE {
            Self::Executor
        } else {
            Self::Client
        }
    }
}

/// A record received on the executor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorRecord<'a> {
    /// Liveness signal. The payload after the prefix is not interpreted.
    Heartbeat { payload: &'a str },
    /// Anything else the executor sends.
    Other(&'a str),
}

impl<'a> ExecutorRecord<'a> {
    pub fn parse(line: &'a str) -> Self {
        line.strip_prefix(HEARTBEAT_PREFIX)
            .map_or(Self::Other(line), |payload| Self::Heartbeat { payload })
    }
}

/// Re-terminate a record for the wire.
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_handshake_claims_executor() {
        assert_eq!(Opening::classify("executor"), Opening::Executor);
        assert_eq!(Opening::classify("executor "), Opening::Client);
        assert_eq!(Opening::classify("Executor"), Opening::Client);
        assert_eq!(Opening::classify(""), Opening::Client);
        assert_eq!(Opening::classify("run build"), Opening::Client);
    }

    #[test]
    fn heartbeat_prefix_is_matched_at_start_only() {
        assert_eq!(
            ExecutorRecord::parse("heartbeat::1712"),
            ExecutorRecord::Heartbeat { payload: "1712" }
        );
        assert_eq!(
            ExecutorRecord::parse("heartbeat::"),
            ExecutorRecord::Heartbeat { payload: "" }
        );
        assert_eq!(
            ExecutorRecord::parse("x heartbeat::1"),
            ExecutorRecord::Other("x heartbeat::1")
        );
        assert_eq!(
            ExecutorRecord::parse("heartbeat:1"),
            ExecutorRecord::Other("heartbeat:1")
        );
    }

    #[test]
    fn encode_appends_single_newline() {
        assert_eq!(encode_line("a"), b"a\n");
        assert_eq!(encode_line(""), b"\n");
    }
}
