// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    ake,
    encoding::{MessageFlags, OTRDecoder, OTREncodable, OTREncoder, CTR_LEN, MAC_LEN},
    instancetag::{self, InstanceTag},
    utils, OTRError, Version,
};

const OTR_USE_INFORMATION_MESSAGE: &[u8] = b"An Off-The-Record conversation has been requested.";

const OTR_PREFIX: &[u8] = b"?OTR";
const OTR_ERROR_PREFIX: &[u8] = b"?OTR Error:";
const OTR_QUERY_PREFIX: &[u8] = b"?OTRv";
const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

const OTR_DH_COMMIT_TYPE_CODE: u8 = 0x02;
const OTR_DH_KEY_TYPE_CODE: u8 = 0x0a;
const OTR_REVEAL_SIGNATURE_TYPE_CODE: u8 = 0x11;
const OTR_SIGNATURE_TYPE_CODE: u8 = 0x12;

/// OTR encoded message type code for OTRv2 + OTRv3 data messages.
const OTR_DATA_TYPE_CODE: u8 = 0x03;

static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?OTR\??(?:v(\d*))?\?").expect("BUG: failed to compile hard-coded regex-pattern.")
});
const QUERY_GROUP_VERSIONS: usize = 1;
static WHITESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r" \t  \t\t\t\t \t \t \t  ((?:[ \t]{8})*)")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
const WHITESPACE_GROUP_TAGS: usize = 1;
const WHITESPACE_PREFIX: &[u8] = b" \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_TAG_OTRV1: &[u8] = b" \t \t  \t ";
const WHITESPACE_TAG_OTRV2: &[u8] = b"  \t\t  \t ";
const WHITESPACE_TAG_OTRV3: &[u8] = b"  \t\t  \t\t";

/// `parse` classifies the (complete, i.e. not fragmented) message and decodes its content.
///
/// Content that cannot be decoded results in an error. OTR-encoded messages of unknown type and
/// other `?OTR`-prefixed content that cannot be classified result in `MessageType::Unrecognized`.
pub fn parse(data: &[u8]) -> Result<MessageType, OTRError> {
    if data.starts_with(OTR_ENCODED_PREFIX) && data.ends_with(OTR_ENCODED_SUFFIX) {
        let start = OTR_ENCODED_PREFIX.len();
        let end = data.len() - OTR_ENCODED_SUFFIX.len();
        parse_encoded_message(&data[start..end])
    } else {
        Ok(parse_plain_message(data))
    }
}

fn parse_encoded_message(data: &[u8]) -> Result<MessageType, OTRError> {
    let data = base64::decode(data).or(Err(OTRError::ProtocolViolation(
        "Invalid message content: content cannot be decoded from base64.",
    )))?;
    let mut decoder = OTRDecoder::new(&data);
    let version: Version = match decoder.read_u16()? {
        0u16 => {
            return Err(OTRError::ProtocolViolation(
                "A protocol version must be provided.",
            ))
        }
        2u16 => Version::V2,
        3u16 => Version::V3,
        version => return Err(OTRError::UnsupportedVersion(version)),
    };
    let message_type = decoder.read_u8()?;
    let (sender, receiver) = if version == Version::V3 {
        (decoder.read_instance_tag()?, decoder.read_instance_tag()?)
    } else {
        (instancetag::INSTANCE_ZERO, instancetag::INSTANCE_ZERO)
    };
    let Some(encoded) = parse_encoded_content(message_type, &mut decoder)? else {
        log::debug!("Unknown encoded message type: {}", message_type);
        return Ok(MessageType::Unrecognized);
    };
    decoder.done()?;
    Ok(MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message: encoded,
    }))
}

fn parse_encoded_content(
    message_type: u8,
    decoder: &mut OTRDecoder,
) -> Result<Option<EncodedMessageType>, OTRError> {
    Ok(Some(match message_type {
        OTR_DH_COMMIT_TYPE_CODE => {
            EncodedMessageType::DHCommit(ake::DHCommitMessage::decode(decoder)?)
        }
        OTR_DH_KEY_TYPE_CODE => EncodedMessageType::DHKey(ake::DHKeyMessage::decode(decoder)?),
        OTR_REVEAL_SIGNATURE_TYPE_CODE => {
            EncodedMessageType::RevealSignature(ake::RevealSignatureMessage::decode(decoder)?)
        }
        OTR_SIGNATURE_TYPE_CODE => {
            EncodedMessageType::Signature(ake::SignatureMessage::decode(decoder)?)
        }
        OTR_DATA_TYPE_CODE => EncodedMessageType::Data(DataMessage::decode(decoder)?),
        _ => return Ok(None),
    }))
}

fn parse_plain_message(data: &[u8]) -> MessageType {
    if data.starts_with(OTR_ERROR_PREFIX) {
        // `?OTR Error:` prefix must start at beginning of message to avoid people messing with OTR
        // in normal plaintext messages.
        let error = &data[OTR_ERROR_PREFIX.len()..];
        return MessageType::Error(Vec::from(error.strip_prefix(b" ").unwrap_or(error)));
    }
    if let Some(caps) = (*QUERY_PATTERN).captures(data) {
        let versions = caps
            .get(QUERY_GROUP_VERSIONS)
            .map_or(&b""[..], |m| m.as_bytes());
        return MessageType::Query(
            versions
                .iter()
                .filter_map(|v| match v {
                    b'2' => Some(Version::V2),
                    b'3' => Some(Version::V3),
                    _ => None,
                })
                .collect(),
        );
    }
    if data.starts_with(OTR_PREFIX) {
        return MessageType::Unrecognized;
    }
    if let Some(caps) = (*WHITESPACE_PATTERN).captures(data) {
        let cleaned = (*WHITESPACE_PATTERN)
            .replace_all(data, b"".as_ref())
            .to_vec();
        let cap = caps
            .get(WHITESPACE_GROUP_TAGS)
            .expect("BUG: hard-coded regex should include capture group");
        return MessageType::Tagged(parse_whitespace_tags(cap.as_bytes()), cleaned);
    }
    MessageType::Plaintext(data.to_vec())
}

fn parse_whitespace_tags(data: &[u8]) -> Vec<Version> {
    let mut result = Vec::new();
    for tag in data.chunks_exact(8) {
        match tag {
            WHITESPACE_TAG_OTRV1 => result.push(Version::Unsupported(1)),
            WHITESPACE_TAG_OTRV2 => result.push(Version::V2),
            WHITESPACE_TAG_OTRV3 => result.push(Version::V3),
            _ => { /* ignore unknown tags */ }
        }
    }
    result
}

#[allow(clippy::large_enum_variant)]
pub enum MessageType {
    Error(Vec<u8>),
    Plaintext(Vec<u8>),
    Tagged(Vec<Version>, Vec<u8>),
    Query(Vec<Version>),
    Encoded(EncodedMessage),
    /// `Unrecognized` is an OTR message whose type cannot be determined.
    Unrecognized,
}

pub struct EncodedMessage {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub message: EncodedMessageType,
}

impl OTREncodable for EncodedMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u16(encode_version(&self.version))
            .write_u8(match self.message {
                EncodedMessageType::DHCommit(_) => OTR_DH_COMMIT_TYPE_CODE,
                EncodedMessageType::DHKey(_) => OTR_DH_KEY_TYPE_CODE,
                EncodedMessageType::RevealSignature(_) => OTR_REVEAL_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Signature(_) => OTR_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Data(_) => OTR_DATA_TYPE_CODE,
            });
        if self.version == Version::V3 {
            encoder.write_u32(self.sender).write_u32(self.receiver);
        }
        encoder.write_encodable(match &self.message {
            EncodedMessageType::DHCommit(msg) => msg,
            EncodedMessageType::DHKey(msg) => msg,
            EncodedMessageType::RevealSignature(msg) => msg,
            EncodedMessageType::Signature(msg) => msg,
            EncodedMessageType::Data(msg) => msg,
        });
    }
}

/// OTR-message represents all of the existing OTR-encoded message structures in use by OTR.
pub enum EncodedMessageType {
    /// DH-Commit-message in the AKE-process.
    DHCommit(ake::DHCommitMessage),
    /// DH-Key-message in the AKE-process.
    DHKey(ake::DHKeyMessage),
    /// RevealSignature-message in the AKE-process.
    RevealSignature(ake::RevealSignatureMessage),
    /// Signature-message in the AKE-process.
    Signature(ake::SignatureMessage),
    /// (Encrypted) data-message.
    Data(DataMessage),
}

pub struct DataMessage {
    pub flags: MessageFlags,
    pub sender_keyid: KeyID,
    pub receiver_keyid: KeyID,
    /// `dh_y` is the sender's next DH public key.
    pub dh_y: BigUint,
    /// The initial counter is a 16-byte value whose first 8 bytes are this value and whose last 8
    /// bytes are all zero.
    pub ctr: [u8; CTR_LEN],
    pub encrypted: Vec<u8>,
    pub authenticator: [u8; MAC_LEN],
    /// revealed contains recent keys, previously used for authentication, that should now become public.
    pub revealed: Vec<u8>,
}

pub type KeyID = u32;

impl DataMessage {
    fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OTRError::ProtocolViolation("Invalid message flags"))?;
        let sender_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let receiver_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let dh_y = decoder.read_mpi()?;
        let ctr = decoder.read_ctr()?;
        let encrypted = decoder.read_data()?;
        let authenticator = decoder.read_mac()?;
        let revealed = decoder.read_data()?;
        if revealed.len() % MAC_LEN != 0 {
            return Err(OTRError::ProtocolViolation(
                "Revealed MACs data does not have expected length.",
            ));
        }
        Ok(Self {
            flags,
            sender_keyid,
            receiver_keyid,
            dh_y,
            ctr,
            encrypted,
            authenticator,
            revealed,
        })
    }
}

impl OTREncodable for DataMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u8(self.flags.bits())
            .write_u32(self.sender_keyid)
            .write_u32(self.receiver_keyid)
            .write_mpi(&self.dh_y)
            .write_ctr(&self.ctr)
            .write_data(&self.encrypted)
            .write_mac(&self.authenticator)
            .write_data(&self.revealed);
    }
}

pub fn encode_message(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: EncodedMessageType,
) -> Vec<u8> {
    serialize_message(&MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message,
    }))
}

/// `serialize_message` (straight-forwardly) serializes provided message into a byte-sequence.
pub fn serialize_message(msg: &MessageType) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    match msg {
        MessageType::Error(error) => {
            buffer.extend_from_slice(OTR_ERROR_PREFIX);
            buffer.push(b' ');
            buffer.extend(error);
            buffer
        }
        MessageType::Plaintext(message) => {
            buffer.extend(message);
            buffer
        }
        MessageType::Tagged(versions, message) => {
            assert!(!versions.is_empty());
            buffer.extend(message);
            buffer.extend_from_slice(WHITESPACE_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV2),
                    Version::V3 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV3),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: only supported versions can be used for tagging.")
                    }
                }
            }
            buffer
        }
        MessageType::Query(versions) => {
            assert!(!versions.is_empty());
            // NOTE: each version listed at most once, in arbitrary order.
            // (Version 1 has deviating syntax but is no longer supported.)
            buffer.extend_from_slice(OTR_QUERY_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.push(b'2'),
                    Version::V3 => buffer.push(b'3'),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: only supported versions can be used for query messages.")
                    }
                }
            }
            buffer.push(b'?');
            buffer.push(b' ');
            buffer.extend_from_slice(OTR_USE_INFORMATION_MESSAGE);
            buffer
        }
        MessageType::Encoded(encoded_message) => {
            buffer.extend_from_slice(OTR_ENCODED_PREFIX);
            buffer.extend(
                base64::encode(OTREncoder::new().write_encodable(encoded_message).to_vec())
                    .into_bytes(),
            );
            buffer.extend_from_slice(OTR_ENCODED_SUFFIX);
            buffer
        }
        MessageType::Unrecognized => panic!("BUG: unrecognized messages cannot be serialized."),
    }
}

/// `encode_authenticator_data` produces the data message content that is authenticated by the
/// MAC: everything from the protocol version up to and including the encrypted message.
pub fn encode_authenticator_data(
    version: &Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: &DataMessage,
) -> Vec<u8> {
    let mut encoder = OTREncoder::new();
    encoder
        .write_u16(encode_version(version))
        .write_u8(OTR_DATA_TYPE_CODE);
    if *version == Version::V3 {
        encoder.write_u32(sender).write_u32(receiver);
    }
    encoder
        .write_u8(message.flags.bits())
        .write_u32(message.sender_keyid)
        .write_u32(message.receiver_keyid)
        .write_mpi(&message.dh_y)
        .write_ctr(&message.ctr)
        .write_data(&message.encrypted)
        .to_vec()
}

fn encode_version(version: &Version) -> u16 {
    match version {
        Version::V2 => 2,
        Version::V3 => 3,
        Version::None | Version::Unsupported(_) => panic!("BUG: unsupported version"),
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use crate::{encoding::MessageFlags, OTRError, Version};

    use super::{
        encode_authenticator_data, encode_message, parse, serialize_message, DataMessage,
        EncodedMessageType, MessageType,
    };

    fn data_message() -> DataMessage {
        DataMessage {
            flags: MessageFlags::IGNORE_UNREADABLE,
            sender_keyid: 1,
            receiver_keyid: 2,
            dh_y: BigUint::from(0x1234_5678_9abc_u64),
            ctr: [1, 2, 3, 4, 5, 6, 7, 8],
            encrypted: Vec::from("encrypted content"),
            authenticator: [9u8; 20],
            revealed: vec![7u8; 40],
        }
    }

    #[test]
    fn test_parse_plaintext() {
        let MessageType::Plaintext(content) = parse(b"Hello world!").unwrap() else {
            panic!("expected plaintext")
        };
        assert_eq!(b"Hello world!".as_slice(), content.as_slice());
    }

    #[test]
    fn test_parse_error_message() {
        let MessageType::Error(error) = parse(b"?OTR Error: Something went wrong.").unwrap()
        else {
            panic!("expected error message")
        };
        assert_eq!(b"Something went wrong.".as_slice(), error.as_slice());
        // error prefix is only recognized at the start of the message
        assert!(matches!(
            parse(b"Hello ?OTR Error: bla").unwrap(),
            MessageType::Plaintext(_)
        ));
    }

    #[test]
    fn test_parse_query_messages() {
        let versions = |data: &[u8]| match parse(data).unwrap() {
            MessageType::Query(versions) => versions,
            _ => panic!("expected query message"),
        };
        assert_eq!(vec![Version::V2, Version::V3], versions(b"?OTRv23?"));
        assert_eq!(vec![Version::V3], versions(b"?OTRv3? Please start OTR."));
        assert_eq!(vec![Version::V2], versions(b"?OTR?v2?"));
        assert_eq!(Vec::<Version>::new(), versions(b"?OTR?"));
        assert_eq!(Vec::<Version>::new(), versions(b"?OTRv14?"));
    }

    #[test]
    fn test_serialize_query_message() {
        assert_eq!(
            b"?OTRv23? An Off-The-Record conversation has been requested.".as_slice(),
            serialize_message(&MessageType::Query(vec![Version::V3, Version::V2])).as_slice()
        );
    }

    #[test]
    fn test_whitespace_tagged_message() {
        let serialized = serialize_message(&MessageType::Tagged(
            vec![Version::V3, Version::V2],
            Vec::from("Hello"),
        ));
        assert_eq!(
            b"Hello \t  \t\t\t\t \t \t \t    \t\t  \t   \t\t  \t\t".as_slice(),
            serialized.as_slice()
        );
        let MessageType::Tagged(versions, content) = parse(&serialized).unwrap() else {
            panic!("expected tagged message")
        };
        assert_eq!(vec![Version::V2, Version::V3], versions);
        assert_eq!(b"Hello".as_slice(), content.as_slice());
    }

    #[test]
    fn test_whitespace_tag_unknown_and_v1_tags() {
        let MessageType::Tagged(versions, content) =
            parse(b"Hi \t  \t\t\t\t \t \t \t   \t \t  \t \t\t\t\t\t\t\t\t there").unwrap()
        else {
            panic!("expected tagged message")
        };
        assert_eq!(vec![Version::Unsupported(1)], versions);
        assert_eq!(b"Hi there".as_slice(), content.as_slice());
    }

    #[test]
    fn test_parse_unrecognized() {
        assert!(matches!(
            parse(b"?OTRsomething").unwrap(),
            MessageType::Unrecognized
        ));
        assert!(matches!(
            parse(b"?OTR:AAN8AAABAAAAAQA=.").unwrap(),
            MessageType::Unrecognized
        ));
    }

    #[test]
    fn test_parse_unsupported_version_1() {
        assert!(matches!(
            parse(b"?OTR:AAEDAAAAAQAAAAEAAAABAA==."),
            Err(OTRError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_parse_invalid_encoded() {
        assert!(matches!(
            parse(b"?OTR:!!!notbase64!!!."),
            Err(OTRError::ProtocolViolation(_))
        ));
        assert!(parse(b"?OTR:AAMD.").is_err());
    }

    #[test]
    fn test_encoded_data_message_v3() {
        let encoded = encode_message(
            Version::V3,
            0x1000,
            0x2000,
            EncodedMessageType::Data(data_message()),
        );
        assert!(encoded.starts_with(b"?OTR:AAMD"));
        let MessageType::Encoded(message) = parse(&encoded).unwrap() else {
            panic!("expected encoded message")
        };
        assert_eq!(Version::V3, message.version);
        assert_eq!(0x1000, message.sender);
        assert_eq!(0x2000, message.receiver);
        let EncodedMessageType::Data(data) = message.message else {
            panic!("expected data message")
        };
        assert_eq!(MessageFlags::IGNORE_UNREADABLE, data.flags);
        assert_eq!(1, data.sender_keyid);
        assert_eq!(2, data.receiver_keyid);
        assert_eq!(BigUint::from(0x1234_5678_9abc_u64), data.dh_y);
        assert_eq!(b"encrypted content".as_slice(), data.encrypted.as_slice());
        assert_eq!(vec![7u8; 40], data.revealed);
    }

    #[test]
    fn test_encoded_data_message_v2_has_no_instance_tags() {
        let encoded = encode_message(
            Version::V2,
            0x1000,
            0x2000,
            EncodedMessageType::Data(data_message()),
        );
        assert!(encoded.starts_with(b"?OTR:AAID"));
        let MessageType::Encoded(message) = parse(&encoded).unwrap() else {
            panic!("expected encoded message")
        };
        assert_eq!(Version::V2, message.version);
        assert_eq!(0, message.sender);
        assert_eq!(0, message.receiver);
        let msg = data_message();
        assert_eq!(
            encode_authenticator_data(&Version::V3, 0x1000, 0x2000, &msg).len(),
            encode_authenticator_data(&Version::V2, 0x1000, 0x2000, &msg).len() + 8
        );
    }

    #[test]
    fn test_revealed_macs_length_checked() {
        let mut msg = data_message();
        msg.revealed = vec![1u8; 21];
        let encoded = encode_message(Version::V3, 0x1000, 0x2000, EncodedMessageType::Data(msg));
        assert!(parse(&encoded).is_err());
    }
}
