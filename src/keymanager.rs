// SPDX-License-Identifier: LGPL-3.0-only

use std::cmp::Ordering;

use num_bigint::BigUint;
use zeroize::Zeroize;

use crate::{
    crypto::{dh, otr::DataSecrets, CryptoError},
    encoding::{CTR_LEN, MAC_LEN},
    messages::KeyID,
    utils, OTRError,
};

/// `MAX_OLD_MACS` is the maximum number of retired MAC keys kept for revealing. Beyond this,
/// the oldest keys are forgotten without being revealed.
const MAX_OLD_MACS: usize = 16;

/// `KeyManager` maintains both our keypairs and received public keys from the other party.
///
/// Our keys rotate as soon as the other party acknowledges our next key by using it. Their keys
/// rotate when they send a message from their current key carrying their next public key.
/// Superseded keys are overwritten, which wipes them.
pub struct KeyManager {
    ours: KeypairRotation,
    theirs: PublicKeyRotation,
    counters: Vec<PairCounters>,
    /// `used_macs` are receiving MAC keys that are used and must be revealed after key rotation.
    used_macs: Vec<MACKeyUsage>,
    /// `old_macs` are MAC keys that are ready to be revealed as key rotation has occurred.
    old_macs: Vec<[u8; MAC_LEN]>,
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.old_macs.zeroize();
    }
}

impl KeyManager {
    pub fn new(ours: (KeyID, dh::Keypair), theirs: (KeyID, BigUint)) -> Result<Self, CryptoError> {
        assert_ne!(0, ours.0);
        assert_ne!(0, theirs.0);
        Ok(Self {
            ours: KeypairRotation::new(ours.0, ours.1)?,
            theirs: PublicKeyRotation::new(theirs.0, theirs.1),
            counters: Vec::new(),
            used_macs: Vec::new(),
            old_macs: Vec::new(),
        })
    }

    pub fn current_keys(&self) -> (KeyID, &dh::Keypair) {
        self.ours.current()
    }

    pub fn next_keys(&self) -> (KeyID, &dh::Keypair) {
        self.ours.next()
    }

    pub fn their_current(&self) -> (KeyID, &BigUint) {
        self.theirs.current()
    }

    /// `session_secrets` derives the data message secrets for the combination of our and their
    /// key IDs. Only the current and next of our keys and the current and previous of their keys
    /// are available.
    pub fn session_secrets(
        &self,
        our_keyid: KeyID,
        their_keyid: KeyID,
    ) -> Result<DataSecrets, OTRError> {
        let ours = self.ours.select(our_keyid)?;
        let theirs = self.theirs.select(their_keyid)?;
        let mut s = ours.generate_shared_secret(theirs);
        let secrets = DataSecrets::derive(&ours.public, theirs, &s);
        s.zeroize();
        Ok(secrets)
    }

    /// `acknowledge_ours` processes the recipient key ID of a received message. If it is our next
    /// key, our keys rotate and the previous keypair is wiped.
    pub fn acknowledge_ours(&mut self, key_id: KeyID) -> Result<(), OTRError> {
        if let Some(retired) = self.ours.acknowledge(key_id)? {
            log::debug!("Our key {} is acknowledged. Retiring key {}.", key_id, retired);
            self.retire(|usage| usage.ours == retired);
            self.counters.retain(|c| c.ours != retired);
        }
        Ok(())
    }

    /// `check_their_key` verifies that `next_key` can be registered for a message sent from key
    /// `sender_keyid`, without registering it.
    pub fn check_their_key(&self, sender_keyid: KeyID, next_key: &BigUint) -> Result<(), OTRError> {
        self.theirs.check(sender_keyid, next_key)
    }

    /// `register_their_key` registers their next public key, as carried by a data message sent
    /// from key `sender_keyid`.
    pub fn register_their_key(
        &mut self,
        sender_keyid: KeyID,
        next_key: BigUint,
    ) -> Result<(), OTRError> {
        if let Some(retired) = self.theirs.register(sender_keyid, next_key)? {
            log::debug!("Their key {} is superseded.", retired);
            self.retire(|usage| usage.theirs == retired);
            self.counters.retain(|c| c.theirs != retired);
        }
        Ok(())
    }

    /// `check_counter` verifies that the counter value is strictly larger than the last received
    /// counter for this combination of keys, without registering it.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn check_counter(
        &self,
        our_keyid: KeyID,
        their_keyid: KeyID,
        ctr: &[u8; CTR_LEN],
    ) -> Result<(), OTRError> {
        self.counters
            .iter()
            .find(|c| c.ours == our_keyid && c.theirs == their_keyid)
            .map_or_else(|| Counter::new().check(ctr), |c| c.receiving.check(ctr))
    }

    /// `verify_counter` verifies that the counter value is strictly larger than the last received
    /// counter for this combination of keys, and then registers it.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn verify_counter(
        &mut self,
        our_keyid: KeyID,
        their_keyid: KeyID,
        ctr: &[u8; CTR_LEN],
    ) -> Result<(), OTRError> {
        self.counters_for(our_keyid, their_keyid).receiving.verify(ctr)
    }

    /// `take_counter` provides the next counter value for sending a message with this
    /// combination of keys.
    pub fn take_counter(&mut self, our_keyid: KeyID, their_keyid: KeyID) -> [u8; CTR_LEN] {
        self.counters_for(our_keyid, their_keyid).sending.take()
    }

    fn counters_for(&mut self, ours: KeyID, theirs: KeyID) -> &mut PairCounters {
        let idx = if let Some(idx) = self
            .counters
            .iter()
            .position(|c| c.ours == ours && c.theirs == theirs)
        {
            idx
        } else {
            self.counters.push(PairCounters {
                ours,
                theirs,
                sending: Counter::new(),
                receiving: Counter::new(),
            });
            self.counters.len() - 1
        };
        &mut self.counters[idx]
    }

    /// `register_used_mac_key` registers a receiving MAC key that was used to verify a message. It
    /// will be revealed once either of the keys in the combination is retired.
    pub fn register_used_mac_key(&mut self, ours: KeyID, theirs: KeyID, key: &[u8; MAC_LEN]) {
        if !self
            .used_macs
            .iter()
            .any(|m| m.ours == ours && m.theirs == theirs)
        {
            self.used_macs.push(MACKeyUsage {
                ours,
                theirs,
                key: *key,
            });
        }
    }

    fn retire<F: Fn(&MACKeyUsage) -> bool>(&mut self, predicate: F) {
        let mut idx = 0;
        while idx < self.used_macs.len() {
            if predicate(&self.used_macs[idx]) {
                let usage = self.used_macs.swap_remove(idx);
                self.old_macs.push(usage.key);
            } else {
                idx += 1;
            }
        }
        while self.old_macs.len() > MAX_OLD_MACS {
            let mut forgotten = self.old_macs.remove(0);
            forgotten.zeroize();
        }
    }

    /// `get_reveal_macs` takes the retired MAC keys for revealing in the next outgoing message.
    pub fn get_reveal_macs(&mut self) -> Vec<u8> {
        let mut reveal_macs = Vec::with_capacity(self.old_macs.len() * MAC_LEN);
        for mac in &self.old_macs {
            reveal_macs.extend_from_slice(mac);
        }
        self.old_macs.zeroize();
        self.old_macs.clear();
        assert_eq!(0, reveal_macs.len() % MAC_LEN);
        reveal_macs
    }
}

struct MACKeyUsage {
    ours: KeyID,
    theirs: KeyID,
    key: [u8; MAC_LEN],
}

impl Drop for MACKeyUsage {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct PairCounters {
    ours: KeyID,
    theirs: KeyID,
    sending: Counter,
    receiving: Counter,
}

/// `NUM_KEYS` is the number of keys that are maintained beforing rotating away and forgetting them forever.
const NUM_KEYS: usize = 2;

/// `KeypairRotation` manages the rotation of our own user's DH keypairs.
///
/// The rotation mechanism works by keeping track of the last confirmed key ID.
/// The next key ID is keyID+1 -- deterministic -- so no need to be stored
/// explicitly. Messaging is required to be in-order for OTR, so as soon as
/// a new public key is acknowledged, we can forget the old keypair.
struct KeypairRotation {
    keys: [dh::Keypair; NUM_KEYS],
    acknowledged: KeyID,
}

impl KeypairRotation {
    fn new(initial_keyid: KeyID, initial_key: dh::Keypair) -> Result<Self, CryptoError> {
        assert_ne!(0, initial_keyid);
        dh::verify_public_key(&initial_key.public).expect("BUG: public key must be valid.");
        let next = dh::Keypair::generate()?;
        let keys = if initial_keyid as usize % NUM_KEYS == 0 {
            [initial_key, next]
        } else {
            [next, initial_key]
        };
        Ok(Self {
            keys,
            acknowledged: initial_keyid,
        })
    }

    /// Get current DH-key, i.e. the key that is acknowledged by the other party.
    fn current(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize) % NUM_KEYS;
        (self.acknowledged, &self.keys[idx])
    }

    /// Get next DH-key (`next_dh`), that is advertised to the other party.
    fn next(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize + 1) % NUM_KEYS;
        (self.acknowledged + 1, &self.keys[idx])
    }

    fn select(&self, key_id: KeyID) -> Result<&dh::Keypair, OTRError> {
        if key_id > 0
            && (self.acknowledged == key_id || self.acknowledged.checked_add(1) == Some(key_id))
        {
            // The message for which we request keys must either contain the acknowledged keyid,
            // or the keyid for the next key (because this is the message that acknowledges it).
            Ok(&self.keys[key_id as usize % NUM_KEYS])
        } else {
            Err(OTRError::ProtocolViolation(
                "Key ID for requested key is not current or next key.",
            ))
        }
    }

    /// Acknowledge that `key_id` was encountered in a return message from other party. This allows
    /// rotating to the next DH-key. Returns the ID of the retired key, if rotation occurred.
    fn acknowledge(&mut self, key_id: KeyID) -> Result<Option<KeyID>, OTRError> {
        if key_id == self.acknowledged {
            Ok(None)
        } else if self.acknowledged.checked_add(1) == Some(key_id) {
            let retired = self.acknowledged;
            let fresh = dh::Keypair::generate()?;
            self.acknowledged = key_id;
            // replacing drops, and therefore wipes, the retired keypair
            self.keys[(self.acknowledged as usize + 1) % NUM_KEYS] = fresh;
            Ok(Some(retired))
        } else {
            Err(OTRError::ProtocolViolation("unexpected keyID to confirm"))
        }
    }
}

/// Public key rotation, for the other party's public keys.
struct PublicKeyRotation {
    keys: [BigUint; NUM_KEYS],
    id: KeyID,
}

impl Drop for PublicKeyRotation {
    fn drop(&mut self) {
        self.id = 0;
        self.keys[0].zeroize();
        self.keys[1].zeroize();
    }
}

impl PublicKeyRotation {
    fn new(key_id: KeyID, public_key: BigUint) -> Self {
        assert_ne!(0, key_id);
        assert_ne!(*utils::biguint::ZERO, public_key);
        let mut keys: [BigUint; NUM_KEYS] = [BigUint::from(0u8), BigUint::from(0u8)];
        keys[key_id as usize % NUM_KEYS] = public_key;
        Self { keys, id: key_id }
    }

    fn current(&self) -> (KeyID, &BigUint) {
        (self.id, &self.keys[self.id as usize % NUM_KEYS])
    }

    fn select(&self, key_id: KeyID) -> Result<&BigUint, OTRError> {
        let key = &self.keys[key_id as usize % NUM_KEYS];
        if key_id > 0 && (self.id == key_id || self.id - 1 == key_id) && *key != *utils::biguint::ZERO
        {
            // Either they have received our acknowledgement first and this message contains the
            // current keyid or the message was sent earlier and this is still the previous keyid.
            Ok(key)
        } else {
            Err(OTRError::ProtocolViolation(
                "Key ID for requested key is not current or previous key.",
            ))
        }
    }

    /// Register next DH public key, carried by a message from `sender_id`. Returns the ID of the
    /// key that is forgotten, if rotation occurred.
    /// `check` verifies whether `next_key`, sent from key `sender_id`, is acceptable.
    fn check(&self, sender_id: KeyID, next_key: &BigUint) -> Result<(), OTRError> {
        if sender_id.checked_add(1) == Some(self.id) {
            // message sent from their previous key: the next key is already registered
            if self.keys[self.id as usize % NUM_KEYS] == *next_key {
                Ok(())
            } else {
                Err(OTRError::ProtocolViolation(
                    "different keys provided for same key ID",
                ))
            }
        } else if sender_id == self.id {
            if self.id == KeyID::MAX {
                return Err(OTRError::ProtocolViolation("Key IDs are exhausted."));
            }
            dh::verify_public_key(next_key).map_err(OTRError::CryptographicViolation)
        } else {
            Err(OTRError::ProtocolViolation(
                "Unexpected next DH public key ID",
            ))
        }
    }

    fn register(&mut self, sender_id: KeyID, next_key: BigUint) -> Result<Option<KeyID>, OTRError> {
        self.check(sender_id, &next_key)?;
        if sender_id == self.id {
            let retired = self.id - 1;
            self.id += 1;
            // replacing drops the previous key
            let idx = self.id as usize % NUM_KEYS;
            self.keys[idx].zeroize();
            self.keys[idx] = next_key;
            Ok(Some(retired))
        } else {
            Ok(None)
        }
    }
}

/// Counter represents either the sending or receiving counter. The counter value is required to be
/// strictly greater than zero. The invariant is uphold in the proper logic sequences for verifying
/// and taking the value:
/// - verify: requires value to be strictly greater than internal state
/// - take: increments internal state before providing value as result
struct Counter([u8; CTR_LEN]);

impl Drop for Counter {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl Counter {
    fn new() -> Counter {
        Counter(COUNTER_INITIAL_VALUE)
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    fn check(&self, ctr: &[u8; CTR_LEN]) -> Result<(), OTRError> {
        if utils::bytes::all_zero(ctr) {
            return Err(OTRError::ProtocolViolation(
                "Counter-value cannot be all-zero.",
            ));
        }
        match utils::bytes::cmp(ctr, &self.0) {
            Ordering::Greater => Ok(()),
            Ordering::Less | Ordering::Equal => Err(OTRError::ProtocolViolation(
                "Counter value must be strictly larger than previous value.",
            )),
        }
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    fn verify(&mut self, ctr: &[u8; CTR_LEN]) -> Result<(), OTRError> {
        self.check(ctr)?;
        self.0 = *ctr;
        Ok(())
    }

    fn take(&mut self) -> [u8; CTR_LEN] {
        let mut carry: bool;
        for idx in (0..CTR_LEN).rev() {
            (self.0[idx], carry) = self.0[idx].overflowing_add(1);
            if carry {
                continue;
            }
            assert!(utils::bytes::any_nonzero(&self.0));
            return self.0;
        }
        panic!("BUG: wrapped around counter value completely.")
    }
}

// NOTE: see invariant: we initialize to zero such that verify/take can work with strict larger
// value than internal state.
const COUNTER_INITIAL_VALUE: [u8; CTR_LEN] = [0, 0, 0, 0, 0, 0, 0, 0];
