// SPDX-License-Identifier: LGPL-3.0-only

use std::{
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    ake::{AKEContext, AKEError, CryptographicMaterial},
    crypto::dsa,
    encoding::{MessageFlags, TLV, TLV_MAX_VALUE_LEN},
    events::{ErrorCode, MessageEvent, SecurityEvent},
    fragment::{self, Assembler, FragmentError},
    instancetag::{self, InstanceTag, INSTANCE_ZERO},
    messages::{self, DataMessage, EncodedMessage, EncodedMessageType, MessageType},
    protocol::{self, ProtocolState},
    smp, utils, Config, Host, OTRError, Policy, ProtocolStatus, UserMessage, Version, SSID,
    TLV_TYPE_1_DISCONNECT, TLV_TYPE_8_EXTRA_SYMMETRIC_KEY,
};

/// `HEARTBEAT_INTERVAL` is the minimum time since our last outgoing message before a heartbeat is
/// sent in response to a received message.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// `Conversation` is a conversation with a single client (instance) of the other party.
///
/// Messages received over the transport are passed to `receive`. Protocol messages, such as AKE
/// messages, heartbeats and SMP messages, are sent through `Host::inject`. Messages of the user are
/// prepared with `send`.
///
/// A conversation is not thread-safe. It must be used from a single thread at a time. Independent
/// conversations do not share state.
pub struct Conversation {
    host: Rc<dyn Host>,
    config: Config,
    our_tag: InstanceTag,
    their_tag: InstanceTag,
    assembler: Assembler,
    state: Box<dyn ProtocolState>,
    ake: AKEContext,
    /// `stored` are messages that wait for a confidential session to be established.
    stored: Vec<Vec<u8>>,
    /// `whitespace` indicates whether outgoing plaintext messages are tagged.
    whitespace: bool,
    last_sent: Instant,
}

impl Conversation {
    /// `new` creates a new conversation with a random instance tag.
    ///
    /// # Errors
    ///
    /// In case the instance tag cannot be generated due to failing randomness.
    pub fn new(host: Rc<dyn Host>, config: Config) -> Result<Self, OTRError> {
        Ok(Self {
            our_tag: instancetag::random_tag()?,
            their_tag: INSTANCE_ZERO,
            assembler: Assembler::new(),
            state: protocol::new_state(),
            ake: AKEContext::new(Rc::clone(&host)),
            stored: Vec::new(),
            whitespace: config.policy.contains(Policy::SEND_WHITESPACE_TAG),
            last_sent: Instant::now(),
            host,
            config,
        })
    }

    #[must_use]
    pub fn status(&self) -> ProtocolStatus {
        self.state.status()
    }

    /// `version` is the protocol version of the confidential session, or `Version::None` if no
    /// session is established.
    #[must_use]
    pub fn version(&self) -> Version {
        self.state.version()
    }

    #[must_use]
    pub fn ssid(&self) -> Option<SSID> {
        self.state.ssid()
    }

    #[must_use]
    pub fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        self.state.their_fingerprint()
    }

    #[must_use]
    pub fn our_instance_tag(&self) -> InstanceTag {
        self.our_tag
    }

    /// `their_instance_tag` is the instance tag of the other party, or `0` if not (yet) known.
    #[must_use]
    pub fn their_instance_tag(&self) -> InstanceTag {
        self.their_tag
    }

    #[must_use]
    pub fn smp_in_progress(&self) -> bool {
        self.state.smp_in_progress()
    }

    pub fn set_fragment_size(&mut self, size: usize) {
        self.config.fragment_size = size;
    }

    /// `receive` processes a message received over the transport. The result is the content, if
    /// any, that is relevant to the user.
    ///
    /// # Errors
    ///
    /// In case the message is malformed or cannot be processed.
    pub fn receive(&mut self, payload: &[u8]) -> Result<UserMessage, OTRError> {
        if self.config.policy.versions().is_empty() {
            return Ok(UserMessage::Plaintext(Vec::from(payload)));
        }
        if fragment::match_fragment(payload) {
            return self.receive_fragment(payload);
        }
        let message = match messages::parse(payload) {
            Ok(message) => message,
            Err(OTRError::UnsupportedVersion(version)) => {
                log::warn!("Received message for unsupported protocol version {}.", version);
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageUnrecognized);
                return Err(OTRError::UnsupportedVersion(version));
            }
            Err(err) => {
                log::debug!("Failed to parse message: {}", err);
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageMalformed);
                return Err(err);
            }
        };
        match message {
            MessageType::Error(error) => {
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageGeneralError(error.clone()));
                if self.config.policy.contains(Policy::ERROR_START_AKE) {
                    self.query()?;
                }
                Ok(UserMessage::Error(error))
            }
            MessageType::Plaintext(content) => {
                // The other party answered without tagging, so they are not interested in OTR.
                self.whitespace = false;
                Ok(self.receive_plaintext(content))
            }
            MessageType::Tagged(versions, content) => {
                self.whitespace = false;
                if self.config.policy.contains(Policy::WHITESPACE_START_AKE)
                    && self.state.status() != ProtocolStatus::Encrypted
                {
                    if let Some(version) = self.select_version(&versions) {
                        self.initiate(version)?;
                    }
                }
                Ok(self.receive_plaintext(content))
            }
            MessageType::Query(versions) => {
                if let Some(version) = self.select_version(&versions) {
                    self.initiate(version)?;
                } else {
                    log::info!("No acceptable version in query: {:?}", versions);
                }
                Ok(UserMessage::None)
            }
            MessageType::Encoded(message) => self.receive_encoded(message),
            MessageType::Unrecognized => {
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageUnrecognized);
                Ok(UserMessage::None)
            }
        }
    }

    fn receive_fragment(&mut self, payload: &[u8]) -> Result<UserMessage, OTRError> {
        let fragment = fragment::parse(payload).ok_or(OTRError::ProtocolViolation(
            "Illegal or unsupported fragment.",
        ))?;
        if fragment.version == Version::V3 {
            if fragment.receiver != INSTANCE_ZERO && fragment.receiver != self.our_tag {
                log::warn!("Dropping fragment intended for another instance.");
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageForOtherInstance);
                return Ok(UserMessage::None);
            }
            if self.their_tag != INSTANCE_ZERO && fragment.sender != self.their_tag {
                log::warn!("Dropping fragment from an unexpected instance.");
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageForOtherInstance);
                return Ok(UserMessage::None);
            }
        }
        match self.assembler.assemble(&fragment) {
            Ok(assembled) => {
                if fragment::match_fragment(&assembled) {
                    return Err(OTRError::ProtocolViolation(
                        "Reassembled content is itself a fragment.",
                    ));
                }
                self.receive(&assembled)
            }
            Err(FragmentError::IncompleteResult) => Ok(UserMessage::None),
            Err(FragmentError::UnexpectedFragment | FragmentError::InvalidData) => {
                log::debug!("Fragment discarded.");
                Ok(UserMessage::None)
            }
        }
    }

    fn receive_plaintext(&self, content: Vec<u8>) -> UserMessage {
        if self.state.status() != ProtocolStatus::Plaintext
            || self.config.policy.contains(Policy::REQUIRE_ENCRYPTION)
        {
            self.host
                .handle_message_event(MessageEvent::ReceivedMessageUnencrypted(content.clone()));
            UserMessage::WarningUnencrypted(content)
        } else {
            UserMessage::Plaintext(content)
        }
    }

    fn receive_encoded(&mut self, message: EncodedMessage) -> Result<UserMessage, OTRError> {
        if !self.config.policy.versions().contains(&message.version) {
            log::warn!(
                "Ignoring message for protocol version {:?} as it is not allowed by policy.",
                message.version
            );
            return Ok(UserMessage::None);
        }
        if message.version == Version::V3 && !self.verify_instance_tags(&message)? {
            return Ok(UserMessage::None);
        }
        self.whitespace = false;
        let EncodedMessage {
            version,
            sender,
            receiver: _,
            message,
        } = message;
        match message {
            EncodedMessageType::DHCommit(msg) => {
                let result = self.ake.handle_dhcommit(version, msg);
                self.their_tag = sender;
                self.handle_ake_response(result);
                Ok(UserMessage::None)
            }
            EncodedMessageType::DHKey(msg) => {
                if !self.verify_ake_version(version) {
                    return Ok(UserMessage::None);
                }
                self.their_tag = sender;
                let result = self.ake.handle_dhkey(msg);
                self.handle_ake_response(result);
                Ok(UserMessage::None)
            }
            EncodedMessageType::RevealSignature(msg) => {
                if !self.verify_ake_version(version) {
                    return Ok(UserMessage::None);
                }
                match self.ake.handle_reveal_signature(msg) {
                    Ok((material, response)) => {
                        self.inject_encoded(material.version, response);
                        self.secure(material)?;
                    }
                    Err(err) => self.handle_ake_error(err),
                }
                Ok(UserMessage::None)
            }
            EncodedMessageType::Signature(msg) => {
                if !self.verify_ake_version(version) {
                    return Ok(UserMessage::None);
                }
                match self.ake.handle_signature(msg) {
                    Ok(material) => self.secure(material)?,
                    Err(err) => self.handle_ake_error(err),
                }
                Ok(UserMessage::None)
            }
            EncodedMessageType::Data(msg) => self.receive_data(version, &msg),
        }
    }

    /// `verify_instance_tags` checks whether the message is intended for us and originates from
    /// the expected instance. Returns `false` if the message must be dropped.
    fn verify_instance_tags(&self, message: &EncodedMessage) -> Result<bool, OTRError> {
        if message.sender == self.our_tag {
            log::warn!("Received our own message.");
            self.host
                .handle_message_event(MessageEvent::MessageReflected);
            return Ok(false);
        }
        if message.sender == INSTANCE_ZERO || instancetag::verify(message.sender).is_err() {
            return Err(OTRError::ProtocolViolation("Invalid sender instance tag."));
        }
        let is_dhcommit = matches!(message.message, EncodedMessageType::DHCommit(_));
        let for_us = message.receiver == self.our_tag
            || (message.receiver == INSTANCE_ZERO && is_dhcommit);
        // A new instance may only start over with a new AKE if no session is established or
        // being established.
        let from_them = self.their_tag == INSTANCE_ZERO
            || message.sender == self.their_tag
            || (is_dhcommit
                && self.state.status() != ProtocolStatus::Encrypted
                && !self.ake.in_progress());
        if for_us && from_them {
            Ok(true)
        } else {
            log::warn!(
                "Dropping message from instance {} for instance {}.",
                message.sender,
                message.receiver
            );
            self.host
                .handle_message_event(MessageEvent::ReceivedMessageForOtherInstance);
            Ok(false)
        }
    }

    fn verify_ake_version(&self, version: Version) -> bool {
        if version == self.ake.version() {
            true
        } else {
            log::debug!(
                "Ignoring AKE message for version {:?}, AKE in progress for version {:?}.",
                version,
                self.ake.version()
            );
            false
        }
    }

    fn handle_ake_response(&mut self, result: Result<EncodedMessageType, AKEError>) {
        match result {
            Ok(response) => self.inject_encoded(self.ake.version(), response),
            Err(err) => self.handle_ake_error(err),
        }
    }

    fn handle_ake_error(&self, err: AKEError) {
        if err == AKEError::MessageIgnored {
            log::debug!("AKE message ignored.");
            return;
        }
        log::warn!("AKE failed: {}", err);
        self.host
            .handle_message_event(MessageEvent::SetupError(OTRError::AuthenticationError(err)));
    }

    /// `secure` transitions to the confidential session and sends any stored messages.
    fn secure(&mut self, material: CryptographicMaterial) -> Result<(), OTRError> {
        let previous = self.state.status();
        self.state = self.state.secure(
            Rc::clone(&self.host),
            self.our_tag,
            self.their_tag,
            material,
        )?;
        log::info!(
            "Confidential session established with protocol version {:?}.",
            self.state.version()
        );
        self.host.handle_security_event(if previous == ProtocolStatus::Encrypted {
            SecurityEvent::RenewedKeys
        } else {
            SecurityEvent::NewKeys
        });
        for message in std::mem::take(&mut self.stored) {
            let data = self
                .state
                .prepare(MessageFlags::empty(), &message, &[])?;
            self.inject_encoded(self.state.version(), data);
            self.host
                .handle_message_event(MessageEvent::MessageResent);
        }
        Ok(())
    }

    fn receive_data(&mut self, version: Version, msg: &DataMessage) -> Result<UserMessage, OTRError> {
        let ignore_unreadable = msg.flags.contains(MessageFlags::IGNORE_UNREADABLE);
        if self.state.status() != ProtocolStatus::Encrypted {
            log::warn!("Received data message without a confidential session.");
            self.host
                .handle_message_event(MessageEvent::ReceivedMessageNotInPrivate);
            if !ignore_unreadable {
                self.inject_error(ErrorCode::MessageNotInPrivate);
            }
            return Ok(UserMessage::None);
        }
        if version != self.state.version() {
            log::warn!("Received data message for a different protocol version.");
            self.host
                .handle_message_event(MessageEvent::ReceivedMessageUnreadable);
            if !ignore_unreadable {
                self.inject_error(ErrorCode::MessageUnreadable);
            }
            return Ok(UserMessage::None);
        }
        let (result, transition) = self.state.handle(msg);
        if let Some(next) = transition {
            self.state = next;
        }
        match result {
            Ok(UserMessage::Confidential(content, tlvs)) => self.process_confidential(content, tlvs),
            Ok(message) => Ok(message),
            Err(OTRError::UnreadableMessage(_)) => {
                log::warn!("Received unreadable data message.");
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageUnreadable);
                if !ignore_unreadable {
                    self.inject_error(ErrorCode::MessageUnreadable);
                }
                Ok(UserMessage::None)
            }
            Err(err) => {
                log::warn!("Received malformed data message: {}", err);
                self.host
                    .handle_message_event(MessageEvent::ReceivedMessageMalformed);
                if !ignore_unreadable {
                    self.inject_error(ErrorCode::MessageMalformed);
                }
                Ok(UserMessage::None)
            }
        }
    }

    fn process_confidential(
        &mut self,
        content: Vec<u8>,
        tlvs: Vec<TLV>,
    ) -> Result<UserMessage, OTRError> {
        if tlvs.iter().any(|t| t.0 == TLV_TYPE_1_DISCONNECT) {
            self.host
                .handle_security_event(SecurityEvent::ConversationEnded);
        } else {
            for tlv in tlvs.iter().filter(|t| smp::is_smp_tlv(t)) {
                match self.state.smp()?.handle(tlv) {
                    Ok((response, event, progress)) => {
                        self.host.handle_smp_event(event, progress);
                        if let Some(response) = response {
                            self.send_tlvs(vec![response])?;
                        }
                    }
                    Err(err) => {
                        log::debug!("Discarded SMP message: {}", err);
                        self.host
                            .handle_message_event(MessageEvent::ReceivedMessageMalformed);
                    }
                }
            }
        }
        if content.is_empty() {
            if tlvs.is_empty() {
                log::debug!("Received heartbeat.");
                self.host
                    .handle_message_event(MessageEvent::LogHeartbeatReceived);
            }
            return Ok(UserMessage::None);
        }
        if self.state.status() == ProtocolStatus::Encrypted
            && self.last_sent.elapsed() > HEARTBEAT_INTERVAL
        {
            self.send_tlvs(Vec::new())?;
            log::debug!("Sent heartbeat.");
            self.host
                .handle_message_event(MessageEvent::LogHeartbeatSent);
        }
        Ok(UserMessage::Confidential(content, tlvs))
    }

    /// `send` prepares the user's message for sending. The result is the list of wire-ready
    /// messages (possibly fragments) to transmit. The list is empty if the message is stored until
    /// a confidential session is established.
    ///
    /// # Errors
    ///
    /// In case the other party ended the confidential session, or the message cannot be encrypted.
    pub fn send(&mut self, content: &[u8]) -> Result<Vec<Vec<u8>>, OTRError> {
        let content = utils::bytes::drop_by_value(content, 0);
        match self.state.status() {
            ProtocolStatus::Plaintext => {
                if self.config.policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    self.stored.push(content);
                    self.host
                        .handle_message_event(MessageEvent::EncryptionRequired);
                    self.query()?;
                    return Ok(Vec::new());
                }
                let versions = self.config.policy.versions();
                let message = if self.whitespace && !versions.is_empty() {
                    MessageType::Tagged(versions, content)
                } else {
                    MessageType::Plaintext(content)
                };
                Ok(vec![messages::serialize_message(&message)])
            }
            ProtocolStatus::Encrypted => {
                let data = self
                    .state
                    .prepare(MessageFlags::empty(), &content, &[])
                    .map_err(|err| {
                        self.host
                            .handle_message_event(MessageEvent::EncryptionError);
                        err
                    })?;
                let encoded = messages::encode_message(
                    self.state.version(),
                    self.our_tag,
                    self.their_tag,
                    data,
                );
                self.last_sent = Instant::now();
                Ok(fragment::fragment(
                    self.config.fragment_size,
                    self.state.version(),
                    self.our_tag,
                    self.their_tag,
                    &encoded,
                ))
            }
            ProtocolStatus::Finished => {
                self.host
                    .handle_message_event(MessageEvent::ConnectionEnded);
                Err(OTRError::ConnectionEnded)
            }
        }
    }

    /// `query` sends a query message listing the versions allowed by policy.
    ///
    /// # Errors
    ///
    /// In case policy allows no protocol versions.
    pub fn query(&mut self) -> Result<(), OTRError> {
        let versions = self.config.policy.versions();
        if versions.is_empty() {
            return Err(OTRError::PolicyRestriction(
                "No protocol versions are allowed.",
            ));
        }
        self.host
            .inject(&messages::serialize_message(&MessageType::Query(versions)));
        Ok(())
    }

    /// `initiate` starts the AKE for the specified protocol version.
    ///
    /// # Errors
    ///
    /// In case the version is not allowed by policy or the AKE cannot be started.
    pub fn initiate(&mut self, version: Version) -> Result<(), OTRError> {
        if !self.config.policy.versions().contains(&version) {
            return Err(OTRError::PolicyRestriction(
                "Protocol version is not allowed.",
            ));
        }
        let message = self.ake.initiate(version)?;
        self.inject_encoded(version, message);
        Ok(())
    }

    /// `end` ends the confidential session, if any. The other party is notified.
    ///
    /// # Errors
    ///
    /// Currently, ending always succeeds.
    pub fn end(&mut self) -> Result<(), OTRError> {
        let version = self.state.version();
        let (disconnect, plaintext) = self.state.finish();
        self.state = plaintext;
        self.ake.reset();
        if let Some(message) = disconnect {
            self.inject_encoded(version, message);
        }
        log::info!("Conversation ended.");
        Ok(())
    }

    /// `start_smp` starts SMP with the other party. If `question` is non-empty, it is sent to the
    /// other party. An exchange in progress is aborted first.
    ///
    /// # Errors
    ///
    /// In case no confidential session is established, or the question is too long.
    pub fn start_smp(&mut self, secret: &[u8], question: &[u8]) -> Result<(), OTRError> {
        if question.len() > smp::MAX_QUESTION_LEN {
            return Err(OTRError::UserError("SMP question is too long."));
        }
        let smp = self.state.smp()?;
        let mut tlvs = Vec::new();
        if smp.in_progress() {
            log::info!("Aborting SMP in progress to start over.");
            tlvs.push(smp.abort());
        }
        tlvs.push(smp.initiate(secret, question)?);
        self.send_tlvs(tlvs)
    }

    /// `provide_secret` answers an SMP request of the other party.
    ///
    /// # Errors
    ///
    /// In case no SMP exchange is waiting for the user's secret.
    pub fn provide_secret(&mut self, secret: &[u8]) -> Result<(), OTRError> {
        let smp = self.state.smp()?;
        if !smp.waiting_for_secret() {
            return Err(OTRError::UserError(
                "No SMP exchange is waiting for a secret.",
            ));
        }
        let tlv = smp.respond(secret)?;
        self.send_tlvs(vec![tlv])
    }

    /// `abort_smp` aborts the SMP exchange and notifies the other party.
    ///
    /// # Errors
    ///
    /// In case no confidential session is established.
    pub fn abort_smp(&mut self) -> Result<(), OTRError> {
        let tlv = self.state.smp()?.abort();
        self.send_tlvs(vec![tlv])
    }

    /// `use_extra_symmetric_key` signals the other party to use the extra symmetric key for the
    /// specified purpose. The key is returned.
    ///
    /// # Errors
    ///
    /// In case no confidential session is established, or the usage data does not fit in a TLV.
    pub fn use_extra_symmetric_key(
        &mut self,
        usage: u32,
        usage_data: &[u8],
    ) -> Result<[u8; 32], OTRError> {
        if usage_data.len() > TLV_MAX_VALUE_LEN - 4 {
            return Err(OTRError::UserError("Usage data is too large."));
        }
        let key = self.state.extra_symmetric_key()?;
        let mut payload = Vec::from(usage.to_be_bytes());
        payload.extend_from_slice(usage_data);
        self.send_tlvs(vec![TLV(TLV_TYPE_8_EXTRA_SYMMETRIC_KEY, payload)])?;
        Ok(key)
    }

    fn send_tlvs(&mut self, tlvs: Vec<TLV>) -> Result<(), OTRError> {
        let message = self
            .state
            .prepare(MessageFlags::IGNORE_UNREADABLE, b"", &tlvs)?;
        self.inject_encoded(self.state.version(), message);
        Ok(())
    }

    fn select_version(&self, offered: &[Version]) -> Option<Version> {
        self.config
            .policy
            .versions()
            .into_iter()
            .find(|v| offered.contains(v))
    }

    fn inject_encoded(&mut self, version: Version, message: EncodedMessageType) {
        let encoded = messages::encode_message(version, self.our_tag, self.their_tag, message);
        for part in fragment::fragment(
            self.config.fragment_size,
            version,
            self.our_tag,
            self.their_tag,
            &encoded,
        ) {
            self.host.inject(&part);
        }
        self.last_sent = Instant::now();
    }

    fn inject_error(&self, code: ErrorCode) {
        let text = self.host.error_message(code);
        self.host
            .inject(&messages::serialize_message(&MessageType::Error(text)));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
        time::{Duration, Instant},
    };

    use crate::{
        crypto::dsa,
        encoding::{OTREncoder, TLV, TLV_MAX_VALUE_LEN},
        events::{MessageEvent, SMPEvent, SecurityEvent},
        smp, utils, Config, Host, OTRError, Policy, ProtocolStatus, UserMessage, Version,
    };

    use super::Conversation;

    struct TestHost {
        keypair: dsa::Keypair,
        injected: RefCell<Vec<Vec<u8>>>,
        security: RefCell<Vec<SecurityEvent>>,
        smp: RefCell<Vec<(SMPEvent, u8)>>,
        messages: RefCell<Vec<MessageEvent>>,
        keys: RefCell<Vec<(u32, Vec<u8>, [u8; 32])>>,
    }

    impl TestHost {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                keypair: dsa::generate_test_keypair(),
                injected: RefCell::new(Vec::new()),
                security: RefCell::new(Vec::new()),
                smp: RefCell::new(Vec::new()),
                messages: RefCell::new(Vec::new()),
                keys: RefCell::new(Vec::new()),
            })
        }

        fn take_injected(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.injected.borrow_mut())
        }

        fn has_message_event<F: Fn(&MessageEvent) -> bool>(&self, predicate: F) -> bool {
            self.messages.borrow().iter().any(predicate)
        }

        fn last_smp_event(&self) -> Option<SMPEvent> {
            self.smp.borrow().last().map(|(event, _)| event.clone())
        }
    }

    impl Host for TestHost {
        fn inject(&self, message: &[u8]) {
            self.injected.borrow_mut().push(Vec::from(message));
        }

        fn keypair(&self) -> &dsa::Keypair {
            &self.keypair
        }

        fn handle_security_event(&self, event: SecurityEvent) {
            self.security.borrow_mut().push(event);
        }

        fn handle_smp_event(&self, event: SMPEvent, progress: u8) {
            self.smp.borrow_mut().push((event, progress));
        }

        fn handle_message_event(&self, event: MessageEvent) {
            self.messages.borrow_mut().push(event);
        }

        fn received_symmetric_key(&self, usage: u32, usage_data: &[u8], key: &[u8; 32]) {
            self.keys
                .borrow_mut()
                .push((usage, Vec::from(usage_data), *key));
        }
    }

    struct Party {
        host: Rc<TestHost>,
        conversation: Conversation,
    }

    impl Party {
        fn new(config: Config) -> Self {
            let host = TestHost::new();
            let conversation =
                Conversation::new(Rc::clone(&host) as Rc<dyn Host>, config).unwrap();
            Self { host, conversation }
        }
    }

    /// `exchange` delivers injected messages in both directions until no more messages are
    /// produced. It returns the user messages received by `alice` and `bob` respectively.
    fn exchange(alice: &mut Party, bob: &mut Party) -> (Vec<UserMessage>, Vec<UserMessage>) {
        let mut alice_received = Vec::new();
        let mut bob_received = Vec::new();
        loop {
            let to_bob = alice.host.take_injected();
            let to_alice = bob.host.take_injected();
            if to_bob.is_empty() && to_alice.is_empty() {
                break;
            }
            for message in to_bob {
                bob_received.push(bob.conversation.receive(&message).unwrap());
            }
            for message in to_alice {
                alice_received.push(alice.conversation.receive(&message).unwrap());
            }
        }
        (alice_received, bob_received)
    }

    fn established(config_alice: Config, config_bob: Config) -> (Party, Party) {
        let mut alice = Party::new(config_alice);
        let mut bob = Party::new(config_bob);
        alice.conversation.query().unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.conversation.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.conversation.status());
        (alice, bob)
    }

    fn confidential(content: &[u8]) -> UserMessage {
        UserMessage::Confidential(Vec::from(content), Vec::new())
    }

    #[test]
    fn test_query_establishes_session() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (alice, bob) = established(Config::default(), Config::default());
        assert_eq!(Version::V3, alice.conversation.version());
        assert_eq!(Version::V3, bob.conversation.version());
        assert!(alice.conversation.ssid().is_some());
        assert_eq!(alice.conversation.ssid(), bob.conversation.ssid());
        assert_eq!(
            alice.conversation.their_instance_tag(),
            bob.conversation.our_instance_tag()
        );
        assert_eq!(
            bob.conversation.their_instance_tag(),
            alice.conversation.our_instance_tag()
        );
        assert_eq!(
            Some(bob.host.keypair.public_key().fingerprint()),
            alice.conversation.their_fingerprint()
        );
        assert_eq!(
            Some(alice.host.keypair.public_key().fingerprint()),
            bob.conversation.their_fingerprint()
        );
        assert_eq!(vec![SecurityEvent::NewKeys], *alice.host.security.borrow());
        assert_eq!(vec![SecurityEvent::NewKeys], *bob.host.security.borrow());
    }

    #[test]
    fn test_version2_session() {
        let v2 = Config {
            policy: Policy::ALLOW_V2,
            fragment_size: 0,
        };
        let (mut alice, mut bob) = established(v2, Config::default());
        assert_eq!(Version::V2, alice.conversation.version());
        assert_eq!(Version::V2, bob.conversation.version());
        assert_eq!(0, alice.conversation.their_instance_tag());
        let parts = alice.conversation.send(b"Hello over version 2").unwrap();
        assert_eq!(1, parts.len());
        assert!(parts[0].starts_with(b"?OTR:AAID"));
        assert_eq!(
            confidential(b"Hello over version 2"),
            bob.conversation.receive(&parts[0]).unwrap()
        );
    }

    #[test]
    fn test_confidential_conversation() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        for i in 0..5 {
            let text = format!("Hello Bob, message {i}");
            let parts = alice.conversation.send(text.as_bytes()).unwrap();
            assert_eq!(1, parts.len());
            assert!(parts[0].starts_with(b"?OTR:AAMD"));
            assert_eq!(
                confidential(text.as_bytes()),
                bob.conversation.receive(&parts[0]).unwrap()
            );
            let text = format!("Hello Alice, reply {i}");
            let parts = bob.conversation.send(text.as_bytes()).unwrap();
            assert_eq!(
                confidential(text.as_bytes()),
                alice.conversation.receive(&parts[0]).unwrap()
            );
        }
        // NULL-bytes are not allowed in the message content.
        let parts = alice.conversation.send(b"Hello\0world").unwrap();
        assert_eq!(
            confidential(b"Helloworld"),
            bob.conversation.receive(&parts[0]).unwrap()
        );
    }

    #[test]
    fn test_fragmented_conversation() {
        let fragmented = Config {
            fragment_size: 120,
            ..Config::default()
        };
        let (mut alice, mut bob) = established(fragmented, fragmented);
        let text = b"This message is long enough to require being split into multiple fragments before sending.";
        let parts = alice.conversation.send(text).unwrap();
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= 120));
        let (last, init) = parts.split_last().unwrap();
        for part in init {
            assert_eq!(UserMessage::None, bob.conversation.receive(part).unwrap());
        }
        assert_eq!(confidential(text), bob.conversation.receive(last).unwrap());
    }

    #[test]
    fn test_fragment_for_other_instance() {
        let (mut alice, _) = established(Config::default(), Config::default());
        alice.conversation.set_fragment_size(120);
        let mut carol = Party::new(Config::default());
        let parts = alice.conversation.send(b"A message that is intended for Bob only and gets fragmented.").unwrap();
        assert!(parts.len() > 1);
        assert_eq!(UserMessage::None, carol.conversation.receive(&parts[0]).unwrap());
        assert!(carol
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageForOtherInstance)));
    }

    #[test]
    fn test_whitespace_tag_starts_ake() {
        let mut alice = Party::new(Config {
            policy: Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG,
            fragment_size: 0,
        });
        let mut bob = Party::new(Config::default());
        let parts = alice.conversation.send(b"Hi Bob").unwrap();
        assert_eq!(1, parts.len());
        assert!(parts[0].starts_with(b"Hi Bob \t  \t\t\t\t \t \t \t  "));
        assert_eq!(
            UserMessage::Plaintext(Vec::from("Hi Bob")),
            bob.conversation.receive(&parts[0]).unwrap()
        );
        exchange(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.conversation.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.conversation.status());
    }

    #[test]
    fn test_whitespace_tag_stops_after_plaintext_reply() {
        let mut alice = Party::new(Config {
            policy: Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG,
            fragment_size: 0,
        });
        assert_eq!(
            UserMessage::Plaintext(Vec::from("Hi Alice")),
            alice.conversation.receive(b"Hi Alice").unwrap()
        );
        assert_eq!(
            vec![Vec::from("Hi Bob")],
            alice.conversation.send(b"Hi Bob").unwrap()
        );
    }

    #[test]
    fn test_require_encryption_resends_stored_message() {
        let mut alice = Party::new(Config {
            policy: Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION,
            fragment_size: 0,
        });
        let mut bob = Party::new(Config::default());
        assert!(alice.conversation.send(b"Secret message").unwrap().is_empty());
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::EncryptionRequired)));
        let (_, bob_received) = exchange(&mut alice, &mut bob);
        assert!(bob_received.contains(&confidential(b"Secret message")));
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::MessageResent)));
    }

    #[test]
    fn test_plaintext_during_session_warns() {
        let (_, mut bob) = established(Config::default(), Config::default());
        assert_eq!(
            UserMessage::WarningUnencrypted(Vec::from("Is this private?")),
            bob.conversation.receive(b"Is this private?").unwrap()
        );
        assert!(bob
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageUnencrypted(_))));
    }

    #[test]
    fn test_end_conversation() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        alice.conversation.end().unwrap();
        assert_eq!(ProtocolStatus::Plaintext, alice.conversation.status());
        assert!(alice.conversation.ssid().is_none());
        exchange(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Finished, bob.conversation.status());
        assert_eq!(
            Some(&SecurityEvent::ConversationEnded),
            bob.host.security.borrow().last()
        );
        assert!(matches!(
            bob.conversation.send(b"Are you still there?"),
            Err(OTRError::ConnectionEnded)
        ));
        bob.conversation.end().unwrap();
        assert_eq!(ProtocolStatus::Plaintext, bob.conversation.status());
        assert!(bob.host.take_injected().is_empty());
    }

    #[test]
    fn test_renewed_keys() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        let ssid = alice.conversation.ssid();
        bob.conversation.query().unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(
            Some(&SecurityEvent::RenewedKeys),
            alice.host.security.borrow().last()
        );
        assert_eq!(
            Some(&SecurityEvent::RenewedKeys),
            bob.host.security.borrow().last()
        );
        assert_ne!(ssid, alice.conversation.ssid());
        assert_eq!(alice.conversation.ssid(), bob.conversation.ssid());
        let parts = bob.conversation.send(b"After renewal").unwrap();
        assert_eq!(
            confidential(b"After renewal"),
            alice.conversation.receive(&parts[0]).unwrap()
        );
    }

    #[test]
    fn test_simultaneous_initiation() {
        let mut alice = Party::new(Config::default());
        let mut bob = Party::new(Config::default());
        alice.conversation.initiate(Version::V3).unwrap();
        bob.conversation.initiate(Version::V3).unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.conversation.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.conversation.status());
        assert_eq!(alice.conversation.ssid(), bob.conversation.ssid());
    }

    #[test]
    fn test_initiate_disallowed_version() {
        let mut alice = Party::new(Config {
            policy: Policy::ALLOW_V3,
            fragment_size: 0,
        });
        assert!(matches!(
            alice.conversation.initiate(Version::V2),
            Err(OTRError::PolicyRestriction(_))
        ));
        assert!(alice.host.take_injected().is_empty());
    }

    #[test]
    fn test_reflected_message() {
        let mut alice = Party::new(Config::default());
        alice.conversation.initiate(Version::V3).unwrap();
        let injected = alice.host.take_injected();
        assert_eq!(
            UserMessage::None,
            alice.conversation.receive(&injected[0]).unwrap()
        );
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::MessageReflected)));
    }

    #[test]
    fn test_message_for_other_instance() {
        let (mut alice, _) = established(Config::default(), Config::default());
        let mut carol = Party::new(Config::default());
        let parts = alice.conversation.send(b"Hello Bob").unwrap();
        assert_eq!(UserMessage::None, carol.conversation.receive(&parts[0]).unwrap());
        assert!(carol
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageForOtherInstance)));
        assert!(carol.host.take_injected().is_empty());
    }

    #[test]
    fn test_replayed_message_unreadable() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        let parts = alice.conversation.send(b"Only once").unwrap();
        assert_eq!(
            confidential(b"Only once"),
            bob.conversation.receive(&parts[0]).unwrap()
        );
        assert_eq!(UserMessage::None, bob.conversation.receive(&parts[0]).unwrap());
        assert!(bob
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageUnreadable)));
        let injected = bob.host.take_injected();
        assert_eq!(1, injected.len());
        assert!(injected[0].starts_with(b"?OTR Error: "));
    }

    #[test]
    fn test_data_message_not_in_private() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        bob.conversation.end().unwrap();
        bob.host.take_injected();
        let parts = alice.conversation.send(b"Hello?").unwrap();
        assert_eq!(UserMessage::None, bob.conversation.receive(&parts[0]).unwrap());
        assert!(bob
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageNotInPrivate)));
        let injected = bob.host.take_injected();
        assert_eq!(1, injected.len());
        assert!(injected[0].starts_with(b"?OTR Error: "));
    }

    #[test]
    fn test_error_message_starts_ake() {
        let mut alice = Party::new(Config::default());
        let mut bob = Party::new(Config::default());
        assert_eq!(
            UserMessage::Error(Vec::from("Something went wrong.")),
            bob.conversation
                .receive(b"?OTR Error: Something went wrong.")
                .unwrap()
        );
        let injected = bob.host.injected.borrow().clone();
        assert_eq!(1, injected.len());
        assert!(injected[0].starts_with(b"?OTRv"));
        exchange(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, bob.conversation.status());
    }

    #[test]
    fn test_unrecognized_message() {
        let mut alice = Party::new(Config::default());
        assert_eq!(
            UserMessage::None,
            alice.conversation.receive(b"?OTR something unknown").unwrap()
        );
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageUnrecognized)));
        assert!(alice.conversation.receive(b"?OTR:AAMD!!!.").is_err());
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageMalformed)));
    }

    #[test]
    fn test_no_versions_allowed() {
        let mut alice = Party::new(Config {
            policy: Policy::empty(),
            fragment_size: 0,
        });
        assert_eq!(
            UserMessage::Plaintext(Vec::from("?OTRv3?")),
            alice.conversation.receive(b"?OTRv3?").unwrap()
        );
        assert!(alice.conversation.query().is_err());
        assert!(alice.host.take_injected().is_empty());
    }

    #[test]
    fn test_heartbeat() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        bob.conversation.last_sent = Instant::now()
            .checked_sub(Duration::from_secs(61))
            .unwrap();
        let parts = alice.conversation.send(b"Are you there?").unwrap();
        assert_eq!(
            confidential(b"Are you there?"),
            bob.conversation.receive(&parts[0]).unwrap()
        );
        assert!(bob
            .host
            .has_message_event(|e| matches!(e, MessageEvent::LogHeartbeatSent)));
        let (alice_received, _) = exchange(&mut alice, &mut bob);
        assert_eq!(vec![UserMessage::None], alice_received);
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::LogHeartbeatReceived)));
        // No heartbeat is sent as long as messages were sent recently.
        let parts = alice.conversation.send(b"Still there?").unwrap();
        bob.conversation.receive(&parts[0]).unwrap();
        assert!(bob.host.take_injected().is_empty());
    }

    #[test]
    fn test_smp_success() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        assert!(!alice.conversation.smp_in_progress());
        alice
            .conversation
            .start_smp(b"The color of the sky", b"What did we talk about?")
            .unwrap();
        assert!(alice.conversation.smp_in_progress());
        exchange(&mut alice, &mut bob);
        assert_eq!(
            Some(SMPEvent::AskForAnswer(Vec::from("What did we talk about?"))),
            bob.host.last_smp_event()
        );
        assert!(bob.conversation.smp_in_progress());
        bob.conversation
            .provide_secret(b"The color of the sky")
            .unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some((SMPEvent::Success, 100)), alice.host.smp.borrow().last().cloned());
        assert_eq!(Some((SMPEvent::Success, 100)), bob.host.smp.borrow().last().cloned());
        assert!(!alice.conversation.smp_in_progress());
        assert!(!bob.conversation.smp_in_progress());
    }

    #[test]
    fn test_smp_failure() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        alice.conversation.start_smp(b"apple", b"").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::AskForSecret), bob.host.last_smp_event());
        bob.conversation.provide_secret(b"orange").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::Failure), alice.host.last_smp_event());
        assert_eq!(Some(SMPEvent::Failure), bob.host.last_smp_event());
    }

    #[test]
    fn test_smp_abort() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        alice.conversation.start_smp(b"apple", b"").unwrap();
        exchange(&mut alice, &mut bob);
        bob.conversation.abort_smp().unwrap();
        assert!(!bob.conversation.smp_in_progress());
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::Abort), alice.host.last_smp_event());
        assert!(!alice.conversation.smp_in_progress());
    }

    #[test]
    fn test_smp_restart_while_in_progress() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        alice.conversation.start_smp(b"first", b"").unwrap();
        exchange(&mut alice, &mut bob);
        alice.conversation.start_smp(b"second", b"").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::AskForSecret), bob.host.last_smp_event());
        bob.conversation.provide_secret(b"second").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::Success), alice.host.last_smp_event());
        assert_eq!(Some(SMPEvent::Success), bob.host.last_smp_event());
    }

    #[test]
    fn test_smp_caller_errors() {
        let mut carol = Party::new(Config::default());
        assert!(carol.conversation.start_smp(b"secret", b"").is_err());
        assert!(carol.conversation.abort_smp().is_err());
        assert!(carol.conversation.provide_secret(b"secret").is_err());
        let (_, mut bob) = established(Config::default(), Config::default());
        assert!(matches!(
            bob.conversation.provide_secret(b"secret"),
            Err(OTRError::UserError(_))
        ));
        assert!(bob.host.take_injected().is_empty());
    }

    #[test]
    fn test_extra_symmetric_key() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        assert!(Party::new(Config::default())
            .conversation
            .use_extra_symmetric_key(1, b"")
            .is_err());
        let key = alice
            .conversation
            .use_extra_symmetric_key(0x42, b"file transfer")
            .unwrap();
        let (_, bob_received) = exchange(&mut alice, &mut bob);
        assert_eq!(vec![UserMessage::None], bob_received);
        assert_eq!(
            vec![(0x42, Vec::from("file transfer"), key)],
            *bob.host.keys.borrow()
        );
    }

    #[test]
    fn test_extra_symmetric_key_oversized_usage_data() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        assert!(matches!(
            alice
                .conversation
                .use_extra_symmetric_key(1, &vec![0x41; 70000]),
            Err(OTRError::UserError(_))
        ));
        assert!(alice.host.take_injected().is_empty());
        let largest = vec![0x41; TLV_MAX_VALUE_LEN - 4];
        let key = alice
            .conversation
            .use_extra_symmetric_key(1, &largest)
            .unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(vec![(1, largest, key)], *bob.host.keys.borrow());
    }

    #[test]
    fn test_smp_question_too_long() {
        let (mut alice, _) = established(Config::default(), Config::default());
        let question = vec![b'?'; smp::MAX_QUESTION_LEN + 1];
        assert!(matches!(
            alice.conversation.start_smp(b"secret", &question),
            Err(OTRError::UserError(_))
        ));
        assert!(!alice.conversation.smp_in_progress());
        assert!(alice.host.take_injected().is_empty());
        let question = vec![b'?'; smp::MAX_QUESTION_LEN];
        alice.conversation.start_smp(b"secret", &question).unwrap();
        assert!(alice.conversation.smp_in_progress());
    }

    #[test]
    fn test_malformed_smp_message_ignored() {
        let (mut alice, mut bob) = established(Config::default(), Config::default());
        alice.conversation.start_smp(b"secret", b"").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::AskForSecret), bob.host.last_smp_event());
        // SMP message 2 carrying only 5 of its 11 MPIs.
        let mpis = vec![(*utils::biguint::TWO).clone(); 5];
        let refs: Vec<_> = mpis.iter().collect();
        let truncated = OTREncoder::new().write_mpi_sequence(&refs).to_vec();
        bob.conversation.send_tlvs(vec![TLV(3, truncated)]).unwrap();
        exchange(&mut alice, &mut bob);
        assert!(alice
            .host
            .has_message_event(|e| matches!(e, MessageEvent::ReceivedMessageMalformed)));
        assert!(!alice
            .host
            .smp
            .borrow()
            .iter()
            .any(|(event, _)| *event == SMPEvent::Cheated));
        assert!(alice.conversation.smp_in_progress());
        assert!(bob.conversation.smp_in_progress());
        bob.conversation.provide_secret(b"secret").unwrap();
        exchange(&mut alice, &mut bob);
        assert_eq!(Some(SMPEvent::Success), alice.host.last_smp_event());
        assert_eq!(Some(SMPEvent::Success), bob.host.last_smp_event());
    }
}
