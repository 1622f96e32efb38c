// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use zeroize::Zeroize;

use crate::{
    ake::CryptographicMaterial,
    crypto::{constant, dsa, sha1},
    encoding::{MessageFlags, OTRDecoder, OTREncoder, TLV, TLV_MAX_VALUE_LEN},
    instancetag::InstanceTag,
    keymanager::KeyManager,
    messages::{encode_authenticator_data, DataMessage, EncodedMessageType},
    smp::SMPContext,
    utils, Host, OTRError, ProtocolStatus, UserMessage, Version, SSID, TLV_TYPE_0_PADDING,
    TLV_TYPE_1_DISCONNECT, TLV_TYPE_8_EXTRA_SYMMETRIC_KEY,
};

const PADDING_GRANULARITY: usize = 256;
const TLV_HEADER_LEN: usize = 4;

/// `ProtocolState` is the message state of a conversation: plaintext, encrypted or finished.
pub trait ProtocolState {
    fn status(&self) -> ProtocolStatus;

    fn version(&self) -> Version;

    /// `handle` handles a received data message. It returns the result of processing and the new
    /// state if a transition is necessary.
    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    );

    /// `secure` produces the encrypted state for the material acquired through a completed AKE.
    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Result<Box<EncryptedState>, OTRError> {
        Ok(Box::new(EncryptedState::new(
            host, our_tag, their_tag, material,
        )?))
    }

    /// `finish` ends the current state, producing a message for the other party if needed.
    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>);

    /// `prepare` prepares a data message with `message` and `tlvs` as content.
    fn prepare(
        &mut self,
        flags: MessageFlags,
        message: &[u8],
        tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError>;

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Err(OTRError::IncorrectState(
            "SMP is unavailable without a confidential session.",
        ))
    }

    fn smp_in_progress(&self) -> bool {
        false
    }

    fn ssid(&self) -> Option<SSID> {
        None
    }

    fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        None
    }

    /// `extra_symmetric_key` provides the extra symmetric key for the current keys.
    fn extra_symmetric_key(&self) -> Result<[u8; 32], OTRError> {
        Err(OTRError::IncorrectState(
            "Extra symmetric key is unavailable without a confidential session.",
        ))
    }
}

pub fn new_state() -> Box<dyn ProtocolState> {
    Box::new(PlaintextState {})
}

pub struct PlaintextState {}

impl ProtocolState for PlaintextState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Plaintext
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        (
            Err(OTRError::IncorrectState(
                "Data message received without a confidential session.",
            )),
            None,
        )
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _: MessageFlags,
        _: &[u8],
        _: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        Err(OTRError::IncorrectState(
            "Data messages cannot be sent without a confidential session.",
        ))
    }
}

pub struct EncryptedState {
    host: Rc<dyn Host>,
    version: Version,
    our_tag: InstanceTag,
    their_tag: InstanceTag,
    ssid: SSID,
    their_dsa: dsa::PublicKey,
    keys: KeyManager,
    smp: SMPContext,
}

impl Drop for EncryptedState {
    fn drop(&mut self) {
        self.ssid.zeroize();
    }
}

impl EncryptedState {
    fn new(
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Result<Self, OTRError> {
        let CryptographicMaterial {
            version,
            ssid,
            our_dh,
            their_dh,
            their_dsa,
        } = material;
        let our_fingerprint = host.keypair().public_key().fingerprint();
        let their_fingerprint = their_dsa.fingerprint();
        Ok(Self {
            keys: KeyManager::new((1, our_dh), (1, their_dh))?,
            smp: SMPContext::new(our_fingerprint, their_fingerprint, ssid),
            host,
            version,
            our_tag,
            their_tag,
            ssid,
            their_dsa,
        })
    }

    /// `decrypt` verifies and decrypts the data message. Keys are rotated only after successful
    /// verification.
    fn decrypt(&mut self, msg: &DataMessage) -> Result<(Vec<u8>, [u8; 32]), OTRError> {
        let our_keyid = msg.receiver_keyid;
        let their_keyid = msg.sender_keyid;
        let secrets = self
            .keys
            .session_secrets(our_keyid, their_keyid)
            .or(Err(OTRError::UnreadableMessage(self.their_tag)))?;
        let authenticator = sha1::hmac(
            secrets.receive_mac(),
            &encode_authenticator_data(&self.version, self.their_tag, self.our_tag, msg),
        );
        constant::verify_bytes(&authenticator, &msg.authenticator)
            .or(Err(OTRError::UnreadableMessage(self.their_tag)))?;
        self.keys
            .check_counter(our_keyid, their_keyid, &msg.ctr)
            .or(Err(OTRError::UnreadableMessage(self.their_tag)))?;
        self.keys.check_their_key(their_keyid, &msg.dh_y)?;
        log::trace!("Data message authenticated.");
        // Nothing is committed before all checks pass.
        self.keys.acknowledge_ours(our_keyid)?;
        self.keys
            .register_their_key(their_keyid, msg.dh_y.clone())?;
        self.keys
            .verify_counter(our_keyid, their_keyid, &msg.ctr)?;
        self.keys
            .register_used_mac_key(our_keyid, their_keyid, secrets.receive_mac());
        let plaintext = secrets
            .receive_key()
            .decrypt(&full_counter(&msg.ctr), &msg.encrypted);
        Ok((plaintext, *secrets.extra_symmetric_key()))
    }

    fn handle_extra_symmetric_key(&self, tlv: &TLV, key: &[u8; 32]) {
        if tlv.1.len() < 4 {
            log::warn!("Ignoring extra symmetric key TLV with insufficient data.");
            return;
        }
        let usage = utils::u32::from_4byte_be(&tlv.1[..4]);
        self.host.received_symmetric_key(usage, &tlv.1[4..], key);
    }
}

impl ProtocolState for EncryptedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Encrypted
    }

    fn version(&self) -> Version {
        self.version
    }

    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        let (mut plaintext, mut extra_key) = match self.decrypt(msg) {
            Ok(decrypted) => decrypted,
            Err(err) => return (Err(err), None),
        };
        let result = parse_plaintext(&plaintext);
        plaintext.zeroize();
        let (content, tlvs) = match result {
            Ok(parsed) => parsed,
            Err(err) => {
                extra_key.zeroize();
                return (Err(err), None);
            }
        };
        for tlv in tlvs
            .iter()
            .filter(|t| t.0 == TLV_TYPE_8_EXTRA_SYMMETRIC_KEY)
        {
            self.handle_extra_symmetric_key(tlv, &extra_key);
        }
        extra_key.zeroize();
        if tlvs.iter().any(|t| t.0 == TLV_TYPE_1_DISCONNECT) {
            log::info!("The other party ended the confidential session.");
            return (
                Ok(UserMessage::Confidential(content, tlvs)),
                Some(Box::new(FinishedState {
                    version: self.version,
                })),
            );
        }
        (Ok(UserMessage::Confidential(content, tlvs)), None)
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        let abort = self
            .prepare(
                MessageFlags::IGNORE_UNREADABLE,
                b"",
                &[TLV(TLV_TYPE_1_DISCONNECT, Vec::new())],
            )
            .ok();
        (abort, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        flags: MessageFlags,
        message: &[u8],
        tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        let mut plaintext = encode_plaintext(message, tlvs)?;
        let (our_keyid, _) = self.keys.current_keys();
        let (their_keyid, _) = self.keys.their_current();
        let secrets = self.keys.session_secrets(our_keyid, their_keyid)?;
        let ctr = self.keys.take_counter(our_keyid, their_keyid);
        let encrypted = secrets
            .send_key()
            .encrypt(&full_counter(&ctr), &plaintext);
        plaintext.zeroize();
        let mut data_message = DataMessage {
            flags,
            sender_keyid: our_keyid,
            receiver_keyid: their_keyid,
            dh_y: self.keys.next_keys().1.public.clone(),
            ctr,
            encrypted,
            authenticator: [0u8; sha1::DIGEST_LEN],
            revealed: Vec::new(),
        };
        data_message.authenticator = sha1::hmac(
            secrets.send_mac(),
            &encode_authenticator_data(&self.version, self.our_tag, self.their_tag, &data_message),
        );
        data_message.revealed = self.keys.get_reveal_macs();
        Ok(EncodedMessageType::Data(data_message))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Ok(&mut self.smp)
    }

    fn smp_in_progress(&self) -> bool {
        self.smp.in_progress()
    }

    fn ssid(&self) -> Option<SSID> {
        Some(self.ssid)
    }

    fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        Some(self.their_dsa.fingerprint())
    }

    fn extra_symmetric_key(&self) -> Result<[u8; 32], OTRError> {
        let (our_keyid, _) = self.keys.current_keys();
        let (their_keyid, _) = self.keys.their_current();
        let secrets = self.keys.session_secrets(our_keyid, their_keyid)?;
        Ok(*secrets.extra_symmetric_key())
    }
}

/// `FinishedState` is the state after the other party ended the confidential session. No messages
/// are sent until the user ends or restarts the session.
pub struct FinishedState {
    version: Version,
}

impl ProtocolState for FinishedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Finished
    }

    fn version(&self) -> Version {
        self.version
    }

    fn handle(
        &mut self,
        _: &DataMessage,
    ) -> (
        Result<UserMessage, OTRError>,
        Option<Box<dyn ProtocolState>>,
    ) {
        (
            Err(OTRError::IncorrectState(
                "Data message received after the confidential session ended.",
            )),
            None,
        )
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _: MessageFlags,
        _: &[u8],
        _: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        Err(OTRError::ConnectionEnded)
    }
}

/// `full_counter` expands the top half of the counter into the 16-byte initial counter value.
fn full_counter(ctr: &[u8; 8]) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(ctr);
    nonce
}

/// `encode_plaintext` encodes the message followed by a NULL-byte and the TLVs. The result is
/// padded with a padding TLV.
fn encode_plaintext(message: &[u8], tlvs: &[TLV]) -> Result<Vec<u8>, OTRError> {
    if tlvs.iter().any(|t| t.1.len() > TLV_MAX_VALUE_LEN) {
        return Err(OTRError::UserError("TLV value is too large."));
    }
    let tlvs_len: usize = tlvs.iter().map(|t| TLV_HEADER_LEN + t.1.len()).sum();
    let padding = (PADDING_GRANULARITY
        - (message.len() + 1 + tlvs_len + TLV_HEADER_LEN) % PADDING_GRANULARITY)
        % PADDING_GRANULARITY;
    let mut encoder = OTREncoder::new();
    encoder.write(message).write_u8(0);
    for tlv in tlvs {
        encoder.write_tlv(tlv);
    }
    encoder.write_tlv(&TLV(TLV_TYPE_0_PADDING, vec![0u8; padding]));
    Ok(encoder.to_vec())
}

/// `parse_plaintext` splits decrypted content into the message and the TLVs, discarding padding.
fn parse_plaintext(plaintext: &[u8]) -> Result<(Vec<u8>, Vec<TLV>), OTRError> {
    let mut decoder = OTRDecoder::new(plaintext);
    let content = decoder.read_bytes_null_terminated();
    let tlvs = decoder
        .read_tlvs()?
        .into_iter()
        .filter(|t| t.0 != TLV_TYPE_0_PADDING)
        .collect();
    decoder.done()?;
    Ok((content, tlvs))
}
