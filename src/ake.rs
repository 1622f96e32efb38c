// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;
use num_integer::Integer;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{
    crypto::{aes128, constant, dh, dsa, otr::AKESecrets, sha256, CryptoError},
    encoding::{OTRDecoder, OTREncodable, OTREncoder, MAC_LEN},
    messages::{EncodedMessageType, KeyID},
    utils, Host, OTRError, Version, SSID,
};

/// The AKE always establishes keyid 1 for both parties.
const AKE_KEYID: KeyID = 1;

/// `AKEContext` drives the Authenticated Key Exchange for a single conversation.
pub struct AKEContext {
    version: Version,
    host: Rc<dyn Host>,
    state: AKEState,
    /// Whether each state that was left behind was wiped completely.
    #[cfg(test)]
    wiped: Vec<bool>,
}

impl Drop for AKEContext {
    fn drop(&mut self) {
        self.state.zeroize();
    }
}

impl AKEContext {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self {
            version: Version::None,
            host,
            state: AKEState::None,
            #[cfg(test)]
            wiped: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// `in_progress` indicates whether an AKE has started and not yet concluded.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, AKEState::None)
    }

    /// `reset` forgets any AKE in progress. All intermediate key material is wiped.
    pub fn reset(&mut self) {
        self.transition(AKEState::None);
    }

    /// `transition` moves to the next state. The previous state is wiped, except for key material
    /// that the next state still holds.
    fn transition(&mut self, next: AKEState) {
        let mut previous = std::mem::replace(&mut self.state, next);
        previous.zeroize();
        #[cfg(test)]
        self.wiped.push(previous.is_wiped());
    }

    /// `initiate` starts a new AKE, forgetting any AKE in progress.
    pub fn initiate(&mut self, version: Version) -> Result<EncodedMessageType, AKEError> {
        log::info!("Initiating AKE for protocol version {:?}.", version);
        let keypair = dh::Keypair::generate()?;
        let r = aes128::Key::generate()?;
        let gxmpi = OTREncoder::new().write_mpi(&keypair.public).to_vec();
        let gx_encrypted = r.encrypt(&[0; 16], &gxmpi);
        let gx_hashed = sha256::digest(&gxmpi).to_vec();
        self.version = version;
        self.transition(AKEState::AwaitingDHKey(AwaitingDHKey {
            our_dh_keypair: Rc::new(keypair),
            r,
        }));
        Ok(EncodedMessageType::DHCommit(DHCommitMessage {
            gx_encrypted,
            gx_hashed,
        }))
    }

    pub fn handle_dhcommit(
        &mut self,
        version: Version,
        msg: DHCommitMessage,
    ) -> Result<EncodedMessageType, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None => Self::handle_dhcommit_from_initial(msg),
            AKEState::AwaitingDHKey(state) => {
                // Both parties sent a D-H Commit message. The symmetry is broken by comparing the
                // hashed gx values as 32-byte unsigned big-endian values.
                let gxmpi = OTREncoder::new()
                    .write_mpi(&state.our_dh_keypair.public)
                    .to_vec();
                let our_gxmpi_hashed = sha256::digest(&gxmpi);
                let our_hash = BigUint::from_bytes_be(&our_gxmpi_hashed);
                let their_hash = BigUint::from_bytes_be(&msg.gx_hashed);
                if our_hash > their_hash {
                    log::debug!("DH-Commit collision: ours wins, resending our DH-Commit.");
                    let gx_encrypted = state.r.encrypt(&[0u8; 16], &gxmpi);
                    let dhcommit = EncodedMessageType::DHCommit(DHCommitMessage {
                        gx_encrypted,
                        gx_hashed: Vec::from(our_gxmpi_hashed),
                    });
                    return Ok(dhcommit);
                }
                log::debug!("DH-Commit collision: theirs wins, continuing as responder.");
                Self::handle_dhcommit_from_initial(msg)
            }
            AKEState::AwaitingRevealSignature(state) => {
                // Retransmit the same D-H Key message, but continue with the new commitment.
                let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
                    gy: state.our_dh_keypair.public.clone(),
                });
                (
                    Ok(dhkey),
                    AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gx_encrypted: msg.gx_encrypted,
                        gx_hashed: msg.gx_hashed,
                    }),
                )
            }
            AKEState::AwaitingSignature(_) => Self::handle_dhcommit_from_initial(msg),
        };
        let response = result?;
        self.version = version;
        self.transition(transition);
        Ok(response)
    }

    fn handle_dhcommit_from_initial(
        msg: DHCommitMessage,
    ) -> (Result<EncodedMessageType, AKEError>, AKEState) {
        // Reply with a D-H Key Message, and transition to awaiting the Reveal Signature.
        let keypair = match dh::Keypair::generate() {
            Ok(keypair) => keypair,
            Err(err) => return (Err(AKEError::from(err)), AKEState::None),
        };
        let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
            gy: keypair.public.clone(),
        });
        (
            Ok(dhkey),
            AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                our_dh_keypair: Rc::new(keypair),
                gx_encrypted: msg.gx_encrypted,
                gx_hashed: msg.gx_hashed,
            }),
        )
    }

    pub fn handle_dhkey(&mut self, msg: DHKeyMessage) -> Result<EncodedMessageType, AKEError> {
        let result = self.process_dhkey(msg);
        if let Err(AKEError::CryptographicViolation(_) | AKEError::DataProcessing(_)) = result {
            self.transition(AKEState::None);
        }
        result
    }

    fn process_dhkey(&mut self, msg: DHKeyMessage) -> Result<EncodedMessageType, AKEError> {
        let (response, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingRevealSignature(_) => {
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingDHKey(state) => {
                dh::verify_public_key(&msg.gy)?;
                // Reply with a Reveal Signature Message and transition to awaiting the Signature.
                let s = state.our_dh_keypair.generate_shared_secret(&msg.gy);
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
                let dsa_keypair = self.host.keypair();
                let pub_b = dsa_keypair.public_key();
                let m_b = compute_m(
                    &secrets.m1,
                    &state.our_dh_keypair.public,
                    &msg.gy,
                    pub_b,
                    AKE_KEYID,
                );
                let sig_b = dsa_keypair.sign(&prehash(&m_b, dsa_keypair.q())?)?;
                log::trace!("M_B: {:?}", &m_b);
                let x_b = OTREncoder::new()
                    .write_public_key(pub_b)
                    .write_u32(AKE_KEYID)
                    .write_signature(&sig_b)
                    .to_vec();
                let enc_b = secrets.c.encrypt(&[0; 16], &x_b);
                let mac_enc_b =
                    sha256::hmac160(&secrets.m2, &OTREncoder::new().write_data(&enc_b).to_vec());
                let reveal_sig_message = RevealSignatureMessage {
                    key: state.r.clone(),
                    signature_encrypted: enc_b,
                    signature_mac: mac_enc_b,
                };
                (
                    EncodedMessageType::RevealSignature(reveal_sig_message.clone()),
                    AKEState::AwaitingSignature(AwaitingSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gy: msg.gy,
                        s,
                        previous_message: reveal_sig_message,
                    }),
                )
            }
            AKEState::AwaitingSignature(state) => {
                if state.gy != msg.gy {
                    return Err(AKEError::MessageIgnored);
                }
                // Retransmission of the same D-H Key message: resend our Reveal Signature.
                return Ok(EncodedMessageType::RevealSignature(
                    state.previous_message.clone(),
                ));
            }
        };
        self.transition(transition);
        Ok(response)
    }

    /// `handle_reveal_signature` verifies the other party's identity and completes the AKE on our
    /// side. Any verification failure aborts the AKE.
    pub fn handle_reveal_signature(
        &mut self,
        msg: RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, EncodedMessageType), AKEError> {
        let result = self.process_reveal_signature(&msg);
        if !matches!(result, Err(AKEError::MessageIgnored)) {
            self.transition(AKEState::None);
        }
        result
    }

    #[allow(clippy::similar_names)]
    fn process_reveal_signature(
        &self,
        msg: &RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, EncodedMessageType), AKEError> {
        let AKEState::AwaitingRevealSignature(state) = &self.state else {
            return Err(AKEError::MessageIgnored);
        };
        log::debug!("Handling Reveal Signature message.");
        // Recover g^x using the revealed key and verify it against the commitment.
        let gxmpi = msg.key.decrypt(&[0; 16], &state.gx_encrypted);
        let gxmpihash = sha256::digest(&gxmpi);
        constant::verify_bytes(&gxmpihash, &state.gx_hashed)?;
        let gx = OTRDecoder::new(&gxmpi)
            .read_mpi()
            .or(Err(AKEError::DataProcessing("Failed to read MPI from gxmpi")))?;
        dh::verify_public_key(&gx)?;
        log::debug!("Commitment of g^x verified.");

        let s = state.our_dh_keypair.generate_shared_secret(&gx);
        let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
        let expected_mac = sha256::hmac160(
            &secrets.m2,
            &OTREncoder::new()
                .write_data(&msg.signature_encrypted)
                .to_vec(),
        );
        constant::verify_bytes(&expected_mac, &msg.signature_mac)?;
        log::debug!("Reveal Signature MAC verified.");

        let x_b = secrets.c.decrypt(&[0; 16], &msg.signature_encrypted);
        let (pub_b, keyid_b, sig_b) = decode_identity(&x_b)?;
        let m_b = compute_m(
            &secrets.m1,
            &gx,
            &state.our_dh_keypair.public,
            &pub_b,
            keyid_b,
        );
        pub_b.verify(&sig_b, &prehash(&m_b, pub_b.q())?)?;
        log::debug!("Signature over M_B verified.");

        let keypair = self.host.keypair();
        let m_a = compute_m(
            &secrets.m1p,
            &state.our_dh_keypair.public,
            &gx,
            keypair.public_key(),
            AKE_KEYID,
        );
        let sig_a = keypair.sign(&prehash(&m_a, keypair.q())?)?;
        let x_a = OTREncoder::new()
            .write_public_key(keypair.public_key())
            .write_u32(AKE_KEYID)
            .write_signature(&sig_a)
            .to_vec();
        let signature_encrypted = secrets.cp.encrypt(&[0; 16], &x_a);
        let signature_mac = sha256::hmac160(
            &secrets.m2p,
            &OTREncoder::new().write_data(&signature_encrypted).to_vec(),
        );
        log::info!("AKE completed as responder.");
        Ok((
            CryptographicMaterial {
                version: self.version,
                ssid: secrets.ssid,
                our_dh: (*state.our_dh_keypair).clone(),
                their_dh: gx,
                their_dsa: pub_b,
            },
            EncodedMessageType::Signature(SignatureMessage {
                signature_encrypted,
                signature_mac,
            }),
        ))
    }

    /// `handle_signature` verifies the other party's identity and completes the AKE. Any
    /// verification failure aborts the AKE.
    pub fn handle_signature(
        &mut self,
        msg: SignatureMessage,
    ) -> Result<CryptographicMaterial, AKEError> {
        let result = self.process_signature(&msg);
        if !matches!(result, Err(AKEError::MessageIgnored)) {
            self.transition(AKEState::None);
        }
        result
    }

    fn process_signature(&self, msg: &SignatureMessage) -> Result<CryptographicMaterial, AKEError> {
        let AKEState::AwaitingSignature(state) = &self.state else {
            return Err(AKEError::MessageIgnored);
        };
        log::debug!("Handling Signature message.");
        let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&state.s).to_vec());
        let mac = sha256::hmac160(
            &secrets.m2p,
            &OTREncoder::new()
                .write_data(&msg.signature_encrypted)
                .to_vec(),
        );
        constant::verify_bytes(&mac, &msg.signature_mac)?;
        log::debug!("Signature MAC verified.");
        let x_a = secrets.cp.decrypt(&[0; 16], &msg.signature_encrypted);
        let (pub_a, keyid_a, sig_a) = decode_identity(&x_a)?;
        let m_a = compute_m(
            &secrets.m1p,
            &state.gy,
            &state.our_dh_keypair.public,
            &pub_a,
            keyid_a,
        );
        pub_a.verify(&sig_a, &prehash(&m_a, pub_a.q())?)?;
        log::info!("AKE completed as initiator.");
        Ok(CryptographicMaterial {
            version: self.version,
            ssid: secrets.ssid,
            our_dh: (*state.our_dh_keypair).clone(),
            their_dh: state.gy.clone(),
            their_dsa: pub_a,
        })
    }
}

/// `compute_m` computes the MAC over the exchanged DH public keys and the identity of the party.
fn compute_m(
    key: &[u8; 32],
    first: &BigUint,
    second: &BigUint,
    public_key: &dsa::PublicKey,
    keyid: KeyID,
) -> [u8; 32] {
    sha256::hmac(
        key,
        &OTREncoder::new()
            .write_mpi(first)
            .write_mpi(second)
            .write_public_key(public_key)
            .write_u32(keyid)
            .to_vec(),
    )
}

/// `prehash` reduces M modulo q. The result is signed as-is, not hashed again.
fn prehash(m: &[u8; 32], q: &BigUint) -> Result<[u8; dsa::PARAM_Q_LEN], AKEError> {
    if q.bits() > dsa::PARAM_Q_LEN * 8 {
        return Err(AKEError::DataProcessing("DSA parameter q is too large"));
    }
    Ok(utils::biguint::to_bytes_be_fixed::<{ dsa::PARAM_Q_LEN }>(
        &BigUint::from_bytes_be(m).mod_floor(q),
    ))
}

/// `decode_identity` decodes the decrypted identity `X`: public key, keyid and signature.
fn decode_identity(x: &[u8]) -> Result<(dsa::PublicKey, KeyID, dsa::Signature), AKEError> {
    let mut decoder = OTRDecoder::new(x);
    let public_key = decoder
        .read_public_key()
        .or(Err(AKEError::DataProcessing("Failed to read public key")))?;
    let keyid = decoder
        .read_u32()
        .or(Err(AKEError::DataProcessing("Failed to read keyid")))?;
    utils::u32::verify_nonzero(keyid, AKEError::DataProcessing("keyid must be non-zero"))?;
    let signature = decoder
        .read_dsa_signature()
        .or(Err(AKEError::DataProcessing("Failed to read signature")))?;
    decoder
        .done()
        .or(Err(AKEError::DataProcessing("Data left over in buffer")))?;
    Ok((public_key, keyid, signature))
}

/// `CryptographicMaterial` contains the cryptographic material acquired during the AKE.
///
/// The AKE always uses keyid 1 for both parties, so no point in including these.
pub struct CryptographicMaterial {
    pub version: Version,
    pub ssid: SSID,
    pub our_dh: dh::Keypair,
    pub their_dh: BigUint,
    pub their_dsa: dsa::PublicKey,
}

/// `AKEState` represents available/recognized AKE states.
enum AKEState {
    /// None indicates no AKE is in progress.
    None,
    AwaitingDHKey(AwaitingDHKey),
    AwaitingRevealSignature(AwaitingRevealSignature),
    AwaitingSignature(AwaitingSignature),
}

impl Zeroize for AKEState {
    fn zeroize(&mut self) {
        match self {
            AKEState::None => {}
            AKEState::AwaitingDHKey(state) => {
                state.r.0.zeroize();
                wipe_keypair(&mut state.our_dh_keypair);
            }
            AKEState::AwaitingRevealSignature(state) => {
                wipe_keypair(&mut state.our_dh_keypair);
            }
            AKEState::AwaitingSignature(state) => {
                state.s.zeroize();
                state.previous_message.key.0.zeroize();
                wipe_keypair(&mut state.our_dh_keypair);
            }
        }
    }
}

#[cfg(test)]
impl AKEState {
    fn is_wiped(&self) -> bool {
        let zero = |v: &BigUint| v.to_bytes_be().iter().all(|b| *b == 0);
        match self {
            AKEState::None => true,
            AKEState::AwaitingDHKey(state) => {
                utils::bytes::all_zero(&state.r.0) && state.our_dh_keypair.private().is_zero()
            }
            AKEState::AwaitingRevealSignature(state) => state.our_dh_keypair.private().is_zero(),
            AKEState::AwaitingSignature(state) => {
                zero(&state.s)
                    && utils::bytes::all_zero(&state.previous_message.key.0)
                    && state.our_dh_keypair.private().is_zero()
            }
        }
    }
}

/// `wipe_keypair` wipes our DH keypair, unless another state still shares it.
fn wipe_keypair(keypair: &mut Rc<dh::Keypair>) {
    if let Some(keypair) = Rc::get_mut(keypair) {
        keypair.zeroize();
    }
}

struct AwaitingDHKey {
    r: aes128::Key,
    our_dh_keypair: Rc<dh::Keypair>,
}

struct AwaitingRevealSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
}

struct AwaitingSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gy: BigUint,
    s: dh::SharedSecret,
    previous_message: RevealSignatureMessage,
}

impl Drop for AwaitingSignature {
    fn drop(&mut self) {
        self.s.zeroize();
    }
}

pub struct DHCommitMessage {
    pub gx_encrypted: Vec<u8>,
    pub gx_hashed: Vec<u8>,
}

impl OTREncodable for DHCommitMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.gx_encrypted)
            .write_data(&self.gx_hashed);
    }
}

impl DHCommitMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHCommitMessage, OTRError> {
        let gx_encrypted = decoder.read_data()?;
        let gx_hashed = decoder.read_data()?;
        if gx_hashed.len() != sha256::DIGEST_LEN {
            return Err(OTRError::ProtocolViolation(
                "Hashed g^x does not have the expected length.",
            ));
        }
        Ok(DHCommitMessage {
            gx_encrypted,
            gx_hashed,
        })
    }
}

pub struct DHKeyMessage {
    pub gy: BigUint,
}

impl OTREncodable for DHKeyMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_mpi(&self.gy);
    }
}

impl DHKeyMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHKeyMessage, OTRError> {
        Ok(DHKeyMessage {
            gy: decoder.read_mpi()?,
        })
    }
}

#[derive(Clone)]
pub struct RevealSignatureMessage {
    pub key: aes128::Key,
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl Drop for RevealSignatureMessage {
    fn drop(&mut self) {
        self.signature_encrypted.fill(0);
        self.signature_mac.fill(0);
    }
}

impl OTREncodable for RevealSignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.key.0)
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

impl RevealSignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<RevealSignatureMessage, OTRError> {
        Ok(RevealSignatureMessage {
            key: aes128::Key(decoder.read_data()?.try_into().or(Err(
                OTRError::ProtocolViolation("Invalid format for 128-bit AES key."),
            ))?),
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

pub struct SignatureMessage {
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl OTREncodable for SignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

impl SignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<SignatureMessage, OTRError> {
        Ok(SignatureMessage {
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

/// `AKEError` contains the variants of errors produced during AKE.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum AKEError {
    /// AKE message processing produced an error due to a cryptographic violation.
    #[error("cryptographic violation: {0}")]
    CryptographicViolation(#[from] CryptoError),
    /// AKE message ignored due to it arriving in violation of protocol.
    #[error("message ignored")]
    MessageIgnored,
    /// AKE message input is incomplete or otherwise non-conforming. Errors were encountered while
    /// reading out message components.
    #[error("data processing: {0}")]
    DataProcessing(&'static str),
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use num_bigint::BigUint;

    use crate::{
        crypto::{dh, dsa, otr::DataSecrets, sha256},
        encoding::OTREncoder,
        events::{MessageEvent, SMPEvent, SecurityEvent},
        messages::EncodedMessageType,
        Host, Version,
    };

    use super::{AKEContext, AKEError, AKEState, CryptographicMaterial};

    struct TestHost(dsa::Keypair);

    impl Host for TestHost {
        fn inject(&self, _message: &[u8]) {
            unimplemented!("message injection is not necessary for tests")
        }

        fn keypair(&self) -> &dsa::Keypair {
            &self.0
        }

        fn handle_security_event(&self, _event: SecurityEvent) {}

        fn handle_smp_event(&self, _event: SMPEvent, _progress: u8) {}

        fn handle_message_event(&self, _event: MessageEvent) {}
    }

    fn contexts() -> (AKEContext, AKEContext) {
        let alice: Rc<dyn Host> = Rc::new(TestHost(dsa::generate_test_keypair()));
        let bob: Rc<dyn Host> = Rc::new(TestHost(dsa::generate_test_keypair()));
        (AKEContext::new(alice), AKEContext::new(bob))
    }

    fn data_secrets(material: &CryptographicMaterial) -> DataSecrets {
        let s = material.our_dh.generate_shared_secret(&material.their_dh);
        DataSecrets::derive(&material.our_dh.public, &material.their_dh, &s)
    }

    #[test]
    fn test_ake_symmetry() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        assert!(alice.in_progress());
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        let (bob_material, signature) = bob.handle_reveal_signature(revealsig).unwrap();
        let EncodedMessageType::Signature(signature) = signature else {
            panic!("expected Signature message")
        };
        let alice_material = alice.handle_signature(signature).unwrap();
        assert!(!alice.in_progress());
        assert!(!bob.in_progress());
        assert_eq!(Version::V3, alice_material.version);
        assert_eq!(Version::V3, bob_material.version);
        assert_eq!(alice_material.ssid, bob_material.ssid);
        assert_eq!(alice_material.our_dh.public, bob_material.their_dh);
        assert_eq!(bob_material.our_dh.public, alice_material.their_dh);
        assert_eq!(
            alice.host.keypair().public_key().fingerprint(),
            bob_material.their_dsa.fingerprint()
        );
        assert_eq!(
            bob.host.keypair().public_key().fingerprint(),
            alice_material.their_dsa.fingerprint()
        );
        let alice_secrets = data_secrets(&alice_material);
        let bob_secrets = data_secrets(&bob_material);
        assert_eq!(alice_secrets.send_key().0, bob_secrets.receive_key().0);
        assert_eq!(alice_secrets.receive_key().0, bob_secrets.send_key().0);
        assert_eq!(alice_secrets.send_mac(), bob_secrets.receive_mac());
        assert_eq!(
            alice_secrets.extra_symmetric_key(),
            bob_secrets.extra_symmetric_key()
        );
    }

    #[test]
    fn test_ake_version_2() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V2).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V2, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        let (bob_material, _) = bob.handle_reveal_signature(revealsig).unwrap();
        assert_eq!(Version::V2, bob_material.version);
        assert_eq!(Version::V2, bob.version());
    }

    #[test]
    fn test_tampered_reveal_signature_aborts() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(mut revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        revealsig.signature_encrypted[7] ^= 0x10;
        assert!(matches!(
            bob.handle_reveal_signature(revealsig),
            Err(AKEError::CryptographicViolation(_))
        ));
        assert!(!bob.in_progress());
    }

    #[test]
    fn test_tampered_revealed_key_aborts() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(mut revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        revealsig.key.0[0] ^= 0x01;
        assert!(bob.handle_reveal_signature(revealsig).is_err());
        assert!(!bob.in_progress());
    }

    #[test]
    fn test_tampered_signature_aborts() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        let (_, signature) = bob.handle_reveal_signature(revealsig).unwrap();
        let EncodedMessageType::Signature(mut signature) = signature else {
            panic!("expected Signature message")
        };
        let last = signature.signature_encrypted.len() - 1;
        signature.signature_encrypted[last] ^= 0x80;
        assert!(matches!(
            alice.handle_signature(signature),
            Err(AKEError::CryptographicViolation(_))
        ));
        assert!(!alice.in_progress());
    }

    #[test]
    fn test_unexpected_messages_are_ignored() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        // Bob awaits the Reveal Signature message, so a DH-Key message is ignored.
        let gy = dhkey.gy.clone();
        assert_eq!(
            Err(AKEError::MessageIgnored),
            bob.handle_dhkey(super::DHKeyMessage { gy }).map(|_| ())
        );
        assert!(bob.in_progress());
        let EncodedMessageType::RevealSignature(first) = alice.handle_dhkey(dhkey).unwrap() else {
            panic!("expected Reveal Signature message")
        };
        // Alice resends the same Reveal Signature for a repeated DH-Key message.
        let gy = bob_dhkey_public(&bob);
        let EncodedMessageType::RevealSignature(second) =
            alice.handle_dhkey(super::DHKeyMessage { gy }).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        assert_eq!(first.signature_encrypted, second.signature_encrypted);
        assert_eq!(first.signature_mac, second.signature_mac);
        // A DH-Key message with a different public key is ignored.
        let other = dh::Keypair::generate().unwrap();
        assert_eq!(
            Err(AKEError::MessageIgnored),
            alice
                .handle_dhkey(super::DHKeyMessage {
                    gy: other.public.clone()
                })
                .map(|_| ())
        );
        assert!(alice.in_progress());
    }

    fn bob_dhkey_public(bob: &AKEContext) -> BigUint {
        let AKEState::AwaitingRevealSignature(state) = &bob.state else {
            panic!("expected bob to await Reveal Signature message")
        };
        state.our_dh_keypair.public.clone()
    }

    #[test]
    fn test_invalid_dhkey_aborts() {
        let (mut alice, _) = contexts();
        alice.initiate(Version::V3).unwrap();
        assert!(matches!(
            alice.handle_dhkey(super::DHKeyMessage {
                gy: BigUint::from(1u8)
            }),
            Err(AKEError::CryptographicViolation(_))
        ));
        assert!(!alice.in_progress());
    }

    #[test]
    fn test_simultaneous_dhcommit_tie_break() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(alice_commit) = alice.initiate(Version::V3).unwrap()
        else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHCommit(bob_commit) = bob.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let alice_hash = BigUint::from_bytes_be(&alice_commit.gx_hashed);
        let bob_hash = BigUint::from_bytes_be(&bob_commit.gx_hashed);
        let alice_response = alice.handle_dhcommit(Version::V3, bob_commit).unwrap();
        let bob_response = bob.handle_dhcommit(Version::V3, alice_commit).unwrap();
        if alice_hash > bob_hash {
            assert!(matches!(alice_response, EncodedMessageType::DHCommit(_)));
            assert!(matches!(bob_response, EncodedMessageType::DHKey(_)));
        } else {
            assert!(matches!(alice_response, EncodedMessageType::DHKey(_)));
            assert!(matches!(bob_response, EncodedMessageType::DHCommit(_)));
        }
    }

    #[test]
    fn test_resent_dhcommit_is_identical() {
        let (mut alice, _) = contexts();
        let EncodedMessageType::DHCommit(ours) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        // A commitment with the lowest possible hash always loses.
        let theirs = super::DHCommitMessage {
            gx_encrypted: vec![1, 2, 3],
            gx_hashed: vec![0u8; sha256::DIGEST_LEN],
        };
        let EncodedMessageType::DHCommit(resent) =
            alice.handle_dhcommit(Version::V3, theirs).unwrap()
        else {
            panic!("expected DH-Commit message")
        };
        assert_eq!(ours.gx_encrypted, resent.gx_encrypted);
        assert_eq!(ours.gx_hashed, resent.gx_hashed);
    }

    #[test]
    fn test_states_wiped_on_completion() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(revealsig) = alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        let (_, signature) = bob.handle_reveal_signature(revealsig).unwrap();
        let EncodedMessageType::Signature(signature) = signature else {
            panic!("expected Signature message")
        };
        alice.handle_signature(signature).unwrap();
        // Alice's keypair moves from awaiting the DH-Key to awaiting the Signature.
        assert_eq!(vec![true, false, true], alice.wiped);
        assert_eq!(vec![true, true], bob.wiped);
    }

    #[test]
    fn test_states_wiped_on_failure() {
        let (mut alice, mut bob) = contexts();
        let EncodedMessageType::DHCommit(dhcommit) = alice.initiate(Version::V3).unwrap() else {
            panic!("expected DH-Commit message")
        };
        let EncodedMessageType::DHKey(dhkey) = bob.handle_dhcommit(Version::V3, dhcommit).unwrap()
        else {
            panic!("expected DH-Key message")
        };
        let EncodedMessageType::RevealSignature(mut revealsig) =
            alice.handle_dhkey(dhkey).unwrap()
        else {
            panic!("expected Reveal Signature message")
        };
        revealsig.signature_mac[0] ^= 0x01;
        assert!(bob.handle_reveal_signature(revealsig).is_err());
        assert!(!bob.in_progress());
        assert_eq!(Some(&true), bob.wiped.last());
        alice.reset();
        assert!(!alice.in_progress());
        assert_eq!(Some(&true), alice.wiped.last());
    }

    #[test]
    fn test_encoded_identity_roundtrip() {
        let keypair = dsa::generate_test_keypair();
        let m = sha256::digest(b"hello");
        let sig = keypair
            .sign(&super::prehash(&m, keypair.q()).unwrap())
            .unwrap();
        let x = OTREncoder::new()
            .write_public_key(keypair.public_key())
            .write_u32(1)
            .write_signature(&sig)
            .to_vec();
        let (pk, keyid, decoded) = super::decode_identity(&x).unwrap();
        assert_eq!(1, keyid);
        assert_eq!(keypair.public_key().fingerprint(), pk.fingerprint());
        pk.verify(&decoded, &super::prehash(&m, pk.q()).unwrap())
            .unwrap();
    }
}
