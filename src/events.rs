// SPDX-License-Identifier: LGPL-3.0-only

//! Events reported to the host application through the `Host` callbacks.

use crate::OTRError;

/// `SecurityEvent` signals changes in the security status of the conversation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SecurityEvent {
    /// An AKE completed and a confidential session is established.
    NewKeys,
    /// An AKE completed while a confidential session was already established.
    RenewedKeys,
    /// The other party ended the confidential session.
    ConversationEnded,
}

/// `SMPEvent` signals progress and results of the socialist millionaire's protocol.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SMPEvent {
    /// Unexpected SMP message received for the current state. The exchange is reset.
    Error,
    /// The other party aborted the exchange.
    Abort,
    /// Verification of the other party's proofs failed. The exchange is reset.
    Cheated,
    /// The other party started SMP with a question. The user needs to provide the answer.
    AskForAnswer(Vec<u8>),
    /// The other party started SMP. The user needs to provide the shared secret.
    AskForSecret,
    InProgress,
    Success,
    Failure,
}

/// `MessageEvent` signals notable occurrences while handling messages.
#[derive(Debug)]
pub enum MessageEvent {
    /// A message is to be sent, but policy requires encryption and no confidential session is
    /// established yet. The message is queued until a session is established.
    EncryptionRequired,
    /// Failed to encrypt a message.
    EncryptionError,
    /// The other party ended the confidential session. Messages are not sent.
    ConnectionEnded,
    /// The AKE failed.
    SetupError(OTRError),
    /// Received one of our own AKE messages.
    MessageReflected,
    /// A queued message was sent after establishing the confidential session.
    MessageResent,
    /// Received an encrypted message while no confidential session is established.
    ReceivedMessageNotInPrivate,
    /// Received an encrypted message that cannot be read.
    ReceivedMessageUnreadable,
    ReceivedMessageMalformed,
    LogHeartbeatReceived,
    LogHeartbeatSent,
    /// Received an OTR error message from the other party.
    ReceivedMessageGeneralError(Vec<u8>),
    /// Received a plaintext message while a confidential session is expected.
    ReceivedMessageUnencrypted(Vec<u8>),
    /// Received an OTR-encoded message of unknown type.
    ReceivedMessageUnrecognized,
    ReceivedMessageForOtherInstance,
}

/// `ErrorCode` identifies the standard error messages sent to the other party.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    EncryptionError,
    MessageUnreadable,
    MessageMalformed,
    MessageNotInPrivate,
}

impl ErrorCode {
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::EncryptionError => "Error occurred encrypting message.",
            ErrorCode::MessageUnreadable => "You transmitted an unreadable encrypted message.",
            ErrorCode::MessageMalformed => "You transmitted a malformed data message.",
            ErrorCode::MessageNotInPrivate => {
                "You sent encrypted data to a peer, who wasn't expecting it."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;

    #[test]
    fn test_default_messages_distinct() {
        let codes = [
            ErrorCode::EncryptionError,
            ErrorCode::MessageUnreadable,
            ErrorCode::MessageMalformed,
            ErrorCode::MessageNotInPrivate,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(!a.default_message().is_empty());
            for b in &codes[i + 1..] {
                assert_ne!(a.default_message(), b.default_message());
            }
        }
    }
}
