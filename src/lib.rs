// SPDX-License-Identifier: LGPL-3.0-only

#![deny(unused_must_use)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use bitflags::bitflags;
use thiserror::Error;

use crate::{
    ake::AKEError,
    crypto::{dsa, CryptoError},
    events::{ErrorCode, MessageEvent, SMPEvent, SecurityEvent},
    instancetag::InstanceTag,
    smp::SMPError,
};

mod ake;
pub mod crypto;
mod encoding;
pub mod events;
mod fragment;
pub mod instancetag;
mod keymanager;
mod messages;
mod protocol;
pub mod session;
mod smp;
mod utils;

pub use encoding::TLV;
pub use session::Conversation;

/// `UserMessage` represents the resulting Message intended for the messaging client, possibly
/// containing content relevant to display to the user.
#[derive(Debug, PartialEq, Eq)]
pub enum UserMessage {
    /// Nothing received that is relevant to report/transfer back to the messaging client.
    None,
    /// Message for user received over open, plaintext transport.
    Plaintext(Vec<u8>),
    /// While encrypted sessions are present or the policy requires encryption, a message is
    /// received in plaintext. The client must know such that it can issue a warning.
    WarningUnencrypted(Vec<u8>),
    /// OTR error message received.
    Error(Vec<u8>),
    /// Message for user received over confidential OTR transport.
    Confidential(Vec<u8>, Vec<TLV>),
}

/// `OTRError` is the enum containing the various errors that can occur.
#[derive(Debug, Error)]
pub enum OTRError {
    /// Message contained invalid data according to the OTR protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Message payload is incomplete. The message cannot be reconstructed from the received bytes.
    #[error("incomplete message")]
    IncompleteMessage,
    /// Encrypted message is unreadable due to loss of keys and/or wrong protocol state.
    #[error("unreadable message for instance {0}")]
    UnreadableMessage(InstanceTag),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    /// The operation is not possible in the current protocol state.
    #[error("incorrect state: {0}")]
    IncorrectState(&'static str),
    /// Violation of cryptographic or mathematical requirement for correct/secure operation.
    #[error("cryptographic violation: {0}")]
    CryptographicViolation(#[from] CryptoError),
    /// (AKE) AuthenticationError indicates that there was an error during AKE.
    #[error("authentication error: {0}")]
    AuthenticationError(#[from] AKEError),
    /// (SMP) error in the socialist millionaire's protocol.
    #[error("SMP error: {0}")]
    SMPError(#[from] SMPError),
    #[error("restricted by policy: {0}")]
    PolicyRestriction(&'static str),
    /// The other party ended the confidential session. Messages are not sent until the session is
    /// reset or restarted.
    #[error("the confidential session was ended by the other party")]
    ConnectionEnded,
    /// The caller requested an action that is not valid at this time.
    #[error("invalid request: {0}")]
    UserError(&'static str),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtocolStatus {
    Plaintext,
    Encrypted,
    Finished,
}

/// `Version` contains the various supported OTR protocol versions.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    None,
    // V1 will not be supported.
    V2,
    V3,
    Unsupported(u16),
}

bitflags! {
    /// `Policy` bit-flags can be set to indicate how OTR should respond to certain events related
    /// to messaging and the OTR protocol.
    pub struct Policy: u32 {
        /// Allow version 2 of the OTR protocol to be used.
        const ALLOW_V2 = 0b0000_0010;
        /// Allow version 3 of the OTR protocol to be used.
        const ALLOW_V3 = 0b0000_0100;
        /// Refuse to send unencrypted messages.
        const REQUIRE_ENCRYPTION = 0b0000_1000;
        /// Advertise your support of OTR using the whitespace tag.
        const SEND_WHITESPACE_TAG = 0b0001_0000;
        /// Start the OTR AKE when you receive a whitespace tag.
        const WHITESPACE_START_AKE = 0b0010_0000;
        /// Start the OTR AKE when you receive an OTR Error Message.
        const ERROR_START_AKE = 0b0100_0000;
    }
}

impl Policy {
    /// `versions` lists the allowed protocol versions, most preferred first.
    #[must_use]
    pub fn versions(self) -> Vec<Version> {
        let mut versions = Vec::new();
        if self.contains(Policy::ALLOW_V3) {
            versions.push(Version::V3);
        }
        if self.contains(Policy::ALLOW_V2) {
            versions.push(Version::V2);
        }
        versions
    }
}

/// `Config` is the configuration of a single conversation.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub policy: Policy,
    /// Maximum size of messages on the transport. `0` means unlimited, i.e. never fragment.
    pub fragment_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::ALLOW_V2
                | Policy::ALLOW_V3
                | Policy::WHITESPACE_START_AKE
                | Policy::ERROR_START_AKE,
            fragment_size: 0,
        }
    }
}

/// `TLVType` is an alias for an u16 value. The values are not restricted. Therefore define the type.
pub type TLVType = u16;

/// `TLV_TYPE_0_PADDING` is the TLV that can be used to introduce arbitrary-length padding to an
/// encrypted message.
pub const TLV_TYPE_0_PADDING: TLVType = 0;

/// `TLV_TYPE_1_DISCONNECT` is the TLV that signals a disconnect.
pub const TLV_TYPE_1_DISCONNECT: TLVType = 1;

/// `TLV_TYPE_8_EXTRA_SYMMETRIC_KEY` signals the use of the extra symmetric key. The payload
/// starts with a 4-byte usage indicator followed by usage-specific data.
pub const TLV_TYPE_8_EXTRA_SYMMETRIC_KEY: TLVType = 8;

/// `SSID` is the secure session id, the first 8 bytes derived from the shared secret.
pub type SSID = [u8; 8];

/// Host represents the interface to the host application, for calling back into the messaging
/// client.
///
/// All callbacks are made synchronously from within the `Conversation` operation that triggered
/// them.
pub trait Host {
    /// Inject a message into the messaging's transport stream. (I.e. protocol-related so not
    /// relevant to return to the client.)
    fn inject(&self, message: &[u8]);

    /// Acquire the long-term DSA keypair from the host application. The long-term keypair, that is
    /// used for authentication purposes, is requested from the host application. This allows the
    /// host control over which keypair to provide for which account.
    fn keypair(&self) -> &dsa::Keypair;

    fn handle_security_event(&self, event: SecurityEvent);

    /// `handle_smp_event` reports progress of the SMP exchange. `progress` is a percentage.
    fn handle_smp_event(&self, event: SMPEvent, progress: u8);

    fn handle_message_event(&self, event: MessageEvent);

    /// `error_message` provides the text that accompanies an OTR error message sent to the other
    /// party.
    fn error_message(&self, code: ErrorCode) -> Vec<u8> {
        Vec::from(code.default_message())
    }

    /// `received_symmetric_key` is called when the other party signals use of the extra symmetric
    /// key.
    fn received_symmetric_key(&self, _usage: u32, _usage_data: &[u8], _key: &[u8; 32]) {}
}
