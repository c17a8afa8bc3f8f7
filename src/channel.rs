//! Events exchanged between the SSH connection handler and the orchestrator
//!
//! Every event carries a one-shot reply slot. Replying consumes the event, so
//! nothing can be answered twice; an event dropped without a reply reads as a
//! refusal on the other side.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

/// Channel type that may be accepted
pub const SESSION: &str = "session";

/// Request type carrying a subsystem name
pub const SUBSYSTEM: &str = "subsystem";

/// The only subsystem served
pub const SFTP: &[u8] = b"sftp";

/// Why a channel open was refused
///
/// Used for logging. The reason code on the wire is chosen by russh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::UnknownChannelType => "unknown channel type",
        }
    }
}

/// Answer to a channel open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// A peer asking to open a channel
pub struct ChannelOpen<S> {
    pub seq: u64,
    pub kind: String,
    pub stream: S,
    pub requests: mpsc::Receiver<ChannelRequest>,
    outcome: oneshot::Sender<OpenOutcome>,
}

impl<S> ChannelOpen<S> {
    pub fn new(
        seq: u64,
        kind: impl Into<String>,
        stream: S,
        requests: mpsc::Receiver<ChannelRequest>,
    ) -> (Self, oneshot::Receiver<OpenOutcome>) {
        let (outcome, rx) = oneshot::channel();
        let open = Self {
            seq,
            kind: kind.into(),
            stream,
            requests,
            outcome,
        };
        (open, rx)
    }

    pub fn is_session(&self) -> bool {
        self.kind == SESSION
    }

    /// Split off the reply slot, keeping the stream and request sequence
    pub fn into_parts(
        self,
    ) -> (
        S,
        mpsc::Receiver<ChannelRequest>,
        oneshot::Sender<OpenOutcome>,
    ) {
        (self.stream, self.requests, self.outcome)
    }
}

/// A request scoped to one channel
#[derive(Debug)]
pub struct ChannelRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: oneshot::Sender<bool>,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, payload: Bytes) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            payload,
            reply,
        };
        (request, rx)
    }

    /// Answer the request
    pub fn reply(self, ok: bool) {
        // The connection may already be gone.
        let _ = self.reply.send(ok);
    }
}

/// A connection-scoped request, unrelated to any channel
#[derive(Debug)]
pub struct GlobalRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl GlobalRequest {
    pub fn new(
        kind: impl Into<String>,
        payload: Bytes,
        want_reply: bool,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let request = Self {
            kind: kind.into(),
            payload,
            reply,
        };
        (request, rx)
    }

    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Drop the request, refusing it if the peer waits for an answer
    pub fn discard(self) {
        if let Some(reply) = self.reply {
            let _ = reply.send(false);
        }
    }
}

/// Whether a request asks for the sftp subsystem
///
/// The payload is an SSH string: a 4-byte big-endian length followed by the
/// name. The length is not trusted, only the bytes after it are compared.
pub fn is_sftp_subsystem(kind: &str, payload: &[u8]) -> bool {
    kind == SUBSYSTEM && payload.len() >= 4 && &payload[4..] == SFTP
}

/// Append an SSH string (length-prefixed bytes)
pub fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Encode a single SSH string as a request payload
pub fn string_payload(value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + value.len());
    put_string(&mut buf, value);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sftp_subsystem_is_recognised() {
        assert!(is_sftp_subsystem("subsystem", &string_payload(b"sftp")));
    }

    #[test]
    fn test_other_request_types_are_not_subsystems() {
        assert!(!is_sftp_subsystem("exec", &string_payload(b"sftp")));
        assert!(!is_sftp_subsystem("shell", &[]));
    }

    #[test]
    fn test_short_payload_is_denied() {
        assert!(!is_sftp_subsystem("subsystem", b""));
        assert!(!is_sftp_subsystem("subsystem", b"sft"));
    }

    #[test]
    fn test_length_prefix_is_skipped_not_checked() {
        assert!(is_sftp_subsystem("subsystem", b"\xff\xff\xff\xffsftp"));
    }

    #[tokio::test]
    async fn test_dropped_request_reads_as_closed() {
        let (request, rx) = ChannelRequest::new("shell", Bytes::new());
        drop(request);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_discard_refuses_when_reply_wanted() {
        let (request, rx) = GlobalRequest::new("tcpip-forward", Bytes::new(), true);
        assert!(request.wants_reply());
        request.discard();
        assert!(!rx.unwrap().await.unwrap());

        let (request, rx) = GlobalRequest::new("keepalive@openssh.com", Bytes::new(), false);
        assert!(rx.is_none());
        request.discard();
    }

    proptest! {
        #[test]
        fn prop_only_exact_sftp_name_matches(name in proptest::collection::vec(any::<u8>(), 0..16)) {
            let payload = string_payload(&name);
            prop_assert_eq!(is_sftp_subsystem("subsystem", &payload), name.as_slice() == SFTP);
        }
    }
}
