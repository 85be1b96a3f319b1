//! Sync wire protocol.
//!
//! ```text
//! frame = messageType:u8 [syncStep:u8 if messageType == 0] payload
//!
//! messageType: 0 = sync, 1 = awareness, 2 = auth, 3 = query-awareness
//! syncStep:    0 = step1 (state vector), 1 = step2 (update reply), 2 = update
//! ```
//!
//! The payload is passed through untouched; validating it is the CRDT
//! engine's job.

use bytes::Bytes;

use crate::error::ProtocolError;

const MSG_SYNC: u8 = 0;
const MSG_AWARENESS: u8 = 1;
const MSG_AUTH: u8 = 2;
const MSG_QUERY_AWARENESS: u8 = 3;

const STEP1: u8 = 0;
const STEP2: u8 = 1;
const UPDATE: u8 = 2;

/// Sub-type of a sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStep {
    /// Request: payload is the sender's state vector.
    Step1,
    /// Reply to step1: payload is the missing update.
    Step2,
    /// Incremental update.
    Update,
}

impl SyncStep {
    pub const fn as_u8(self) -> u8 {
        match self {
            SyncStep::Step1 => STEP1,
            SyncStep::Step2 => STEP2,
            SyncStep::Update => UPDATE,
        }
    }
}

impl TryFrom<u8> for SyncStep {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            STEP1 => Ok(SyncStep::Step1),
            STEP2 => Ok(SyncStep::Step2),
            UPDATE => Ok(SyncStep::Update),
            other => Err(ProtocolError::UnknownSyncStep(other)),
        }
    }
}

/// Message type, with the sync step carried only by the sync variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Sync(SyncStep),
    Awareness,
    Auth,
    QueryAwareness,
}

impl MessageKind {
    pub const fn type_byte(self) -> u8 {
        match self {
            MessageKind::Sync(_) => MSG_SYNC,
            MessageKind::Awareness => MSG_AWARENESS,
            MessageKind::Auth => MSG_AUTH,
            MessageKind::QueryAwareness => MSG_QUERY_AWARENESS,
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    kind: MessageKind,
    payload: Bytes,
}

impl SyncMessage {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn step1(state_vector: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Sync(SyncStep::Step1), state_vector)
    }

    pub fn step2(update: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Sync(SyncStep::Step2), update)
    }

    pub fn update(update: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Sync(SyncStep::Update), update)
    }

    pub fn awareness(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Awareness, payload)
    }

    pub fn auth(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Auth, payload)
    }

    pub fn query_awareness() -> Self {
        Self::new(MessageKind::QueryAwareness, Bytes::new())
    }

    /// Parse a frame. Unknown discriminants are rejected.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&type_byte, rest) = frame.split_first().ok_or(ProtocolError::Empty)?;

        let (kind, payload) = match type_byte {
            MSG_SYNC => {
                let (&step_byte, payload) =
                    rest.split_first().ok_or(ProtocolError::MissingSyncStep)?;
                (MessageKind::Sync(SyncStep::try_from(step_byte)?), payload)
            }
            MSG_AWARENESS => (MessageKind::Awareness, rest),
            MSG_AUTH => (MessageKind::Auth, rest),
            MSG_QUERY_AWARENESS => (MessageKind::QueryAwareness, rest),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Serialize to a frame; the inverse of `decode`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.kind.type_byte());
        if let MessageKind::Sync(step) = self.kind {
            out.push(step.as_u8());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub const fn is_sync_message(&self) -> bool {
        matches!(self.kind, MessageKind::Sync(_))
    }

    pub const fn is_awareness_message(&self) -> bool {
        matches!(self.kind, MessageKind::Awareness)
    }

    pub const fn is_auth_message(&self) -> bool {
        matches!(self.kind, MessageKind::Auth)
    }

    pub const fn is_query_awareness_message(&self) -> bool {
        matches!(self.kind, MessageKind::QueryAwareness)
    }

    pub const fn is_step1(&self) -> bool {
        matches!(self.kind, MessageKind::Sync(SyncStep::Step1))
    }

    pub const fn is_step2(&self) -> bool {
        matches!(self.kind, MessageKind::Sync(SyncStep::Step2))
    }

    pub const fn is_update(&self) -> bool {
        matches!(self.kind, MessageKind::Sync(SyncStep::Update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(&[0, 0, 9, 9], MessageKind::Sync(SyncStep::Step1), &[9, 9])]
    #[case(&[0, 1], MessageKind::Sync(SyncStep::Step2), &[])]
    #[case(&[0, 2, 0xff], MessageKind::Sync(SyncStep::Update), &[0xff])]
    #[case(&[1, 4, 5], MessageKind::Awareness, &[4, 5])]
    #[case(&[2], MessageKind::Auth, &[])]
    #[case(&[3], MessageKind::QueryAwareness, &[])]
    fn test_decode_known_frames(
        #[case] frame: &[u8],
        #[case] kind: MessageKind,
        #[case] payload: &[u8],
    ) {
        let msg = SyncMessage::decode(frame).unwrap();
        assert_eq!(msg.kind(), kind);
        assert_eq!(msg.payload().as_ref(), payload);
        assert_eq!(msg.encode(), frame);
    }

    #[rstest]
    #[case(&[], ProtocolError::Empty)]
    #[case(&[4, 1, 2], ProtocolError::UnknownMessageType(4))]
    #[case(&[0xff], ProtocolError::UnknownMessageType(0xff))]
    #[case(&[0], ProtocolError::MissingSyncStep)]
    #[case(&[0, 3, 1], ProtocolError::UnknownSyncStep(3))]
    fn test_decode_rejects_malformed(#[case] frame: &[u8], #[case] expected: ProtocolError) {
        let err = SyncMessage::decode(frame).unwrap_err();
        assert_eq!(err, expected);
        assert_eq!(err.code(), "MALFORMED_FRAME");
    }

    #[test]
    fn test_round_trip_preserves_payload_bytes() {
        // A payload that starts with bytes that look like discriminants.
        let msg = SyncMessage::update(vec![0u8, 1, 2, 3, 0]);
        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_predicates() {
        let step1 = SyncMessage::step1(Bytes::new());
        assert!(step1.is_sync_message() && step1.is_step1());
        assert!(!step1.is_step2() && !step1.is_update());

        let update = SyncMessage::update(Bytes::from_static(b"u"));
        assert!(update.is_sync_message() && update.is_update());

        let awareness = SyncMessage::awareness(Bytes::new());
        assert!(awareness.is_awareness_message());
        assert!(!awareness.is_sync_message() && !awareness.is_step1());

        assert!(SyncMessage::auth(Bytes::new()).is_auth_message());
        assert!(SyncMessage::query_awareness().is_query_awareness_message());
    }
}
