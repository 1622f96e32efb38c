// SPDX-License-Identifier: LGPL-3.0-only

use thiserror::Error;

/// `CryptoError` is the error produced by cryptographic primitives and their verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Verification of a cryptographic value failed.
    #[error("verification failed: {0}")]
    VerificationFailure(&'static str),
    /// The system's secure random source failed to produce random data.
    #[error("secure random source failed")]
    RandomnessFailure,
}

/// `dh` contains the Diffie-Hellman group (RFC 3526, 1536-bit MODP group) used by the AKE, the
/// data message key exchange and SMP.
pub mod dh {
    use crypto_bigint::{
        modular::runtime_mod::{DynResidue, DynResidueParams},
        Encoding, U1536,
    };
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;
    use zeroize::Zeroize;

    use crate::utils;

    use super::CryptoError;

    /// Length in bytes of elements of the group.
    pub const ELEMENT_LEN: usize = 192;
    /// OTR prescribes DH private keys of at least 320 bits.
    const PRIVATE_KEY_LEN: usize = 40;

    const MODULUS_HEX: &str = concat!(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
        "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
        "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
        "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
        "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
        "9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
    );

    type Residue = DynResidue<{ U1536::LIMBS }>;
    type ResidueParams = DynResidueParams<{ U1536::LIMBS }>;

    static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));
    static MODULUS: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(MODULUS_HEX.as_bytes(), 16)
            .expect("BUG: failed to parse hard-coded group modulus")
    });
    static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - &*utils::biguint::TWO);
    /// `ORDER` is the prime order `q = (p-1)/2` of the subgroup generated by `g`.
    static ORDER: Lazy<BigUint> =
        Lazy::new(|| (&*MODULUS - &*utils::biguint::ONE) / &*utils::biguint::TWO);
    static MODULUS_PARAMS: Lazy<ResidueParams> =
        Lazy::new(|| DynResidueParams::new(&to_uint(&MODULUS)));
    static ORDER_PARAMS: Lazy<ResidueParams> =
        Lazy::new(|| DynResidueParams::new(&to_uint(&ORDER)));

    #[must_use]
    pub fn generator() -> &'static BigUint {
        &GENERATOR
    }

    #[must_use]
    pub fn modulus() -> &'static BigUint {
        &MODULUS
    }

    #[must_use]
    pub fn order() -> &'static BigUint {
        &ORDER
    }

    /// `verify_public_key` verifies that a received group element is in range `[2, p-2]`.
    pub fn verify_public_key(public_key: &BigUint) -> Result<(), CryptoError> {
        if public_key >= &*GENERATOR && public_key <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH public key fails verification.",
            ))
        }
    }

    /// `verify_exponent` verifies that a received exponent is in range `[1, q)`.
    pub fn verify_exponent(exponent: &BigUint) -> Result<(), CryptoError> {
        if exponent >= &*utils::biguint::ONE && exponent < &*ORDER {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "exponent is outside of the valid range.",
            ))
        }
    }

    /// `modpow` computes `base^exponent mod p` for public exponents.
    #[must_use]
    pub fn modpow(base: &BigUint, exponent: &BigUint) -> BigUint {
        base.modpow(exponent, &MODULUS)
    }

    /// `modpow_secret` computes `base^exponent mod p` in constant time with respect to the
    /// exponent.
    #[must_use]
    pub fn modpow_secret(base: &BigUint, exponent: &Exponent) -> BigUint {
        let base = Residue::new(&to_uint(&(base % &*MODULUS)), *MODULUS_PARAMS);
        from_uint(&base.pow(&exponent.0).retrieve())
    }

    #[must_use]
    pub fn mul(a: &BigUint, b: &BigUint) -> BigUint {
        (a * b) % &*MODULUS
    }

    /// `inverse` computes the multiplicative inverse of `value` modulo the (prime) modulus.
    #[must_use]
    pub fn inverse(value: &BigUint) -> BigUint {
        value.modpow(&MODULUS_MINUS_TWO, &MODULUS)
    }

    /// `sub_mul_mod_q` computes `(r - a*c) mod q` without leaking the secret values `r` and `a`.
    #[must_use]
    pub fn sub_mul_mod_q(r: &Exponent, a: &Exponent, c: &BigUint) -> BigUint {
        let r = Residue::new(&r.0, *ORDER_PARAMS);
        let a = Residue::new(&a.0, *ORDER_PARAMS);
        let c = Residue::new(&to_uint(&(c % &*ORDER)), *ORDER_PARAMS);
        from_uint(&(&r - &(&a * &c)).retrieve())
    }

    fn to_uint(value: &BigUint) -> U1536 {
        let mut bytes = utils::biguint::to_bytes_be_fixed::<ELEMENT_LEN>(value);
        let result = U1536::from_be_slice(&bytes);
        bytes.zeroize();
        result
    }

    fn from_uint(value: &U1536) -> BigUint {
        BigUint::from_bytes_be(&value.to_be_bytes())
    }

    /// `Exponent` is a secret exponent. It is only ever used with constant-time arithmetic and it
    /// is zeroed when dropped.
    #[derive(Clone)]
    pub struct Exponent(U1536);

    impl Drop for Exponent {
        fn drop(&mut self) {
            self.0.zeroize();
        }
    }

    impl Zeroize for Exponent {
        fn zeroize(&mut self) {
            self.0.zeroize();
        }
    }

    impl Exponent {
        /// `generate` generates a random 320-bit private key.
        pub fn generate() -> Result<Self, CryptoError> {
            let mut bytes = [0u8; ELEMENT_LEN];
            utils::random::fill_secure_bytes(&mut bytes[ELEMENT_LEN - PRIVATE_KEY_LEN..])?;
            let exponent = Self(U1536::from_be_slice(&bytes));
            bytes.zeroize();
            Ok(exponent)
        }

        /// `random_mod_q` generates a random 1536-bit value, reduced modulo `q`.
        pub fn random_mod_q() -> Result<Self, CryptoError> {
            let mut bytes = [0u8; ELEMENT_LEN];
            utils::random::fill_secure_bytes(&mut bytes)?;
            let mut value = U1536::from_be_slice(&bytes);
            bytes.zeroize();
            let exponent = Self(Residue::new(&value, *ORDER_PARAMS).retrieve());
            value.zeroize();
            Ok(exponent)
        }

        /// `from_bytes_be` constructs an exponent from (at most 192) big-endian bytes.
        ///
        /// # Panics
        ///
        /// Panics if more than 192 bytes are provided.
        #[must_use]
        pub fn from_bytes_be(value: &[u8]) -> Self {
            assert!(value.len() <= ELEMENT_LEN, "BUG: exponent value is too large");
            let mut bytes = [0u8; ELEMENT_LEN];
            bytes[ELEMENT_LEN - value.len()..].copy_from_slice(value);
            let exponent = Self(U1536::from_be_slice(&bytes));
            bytes.zeroize();
            exponent
        }

        #[must_use]
        pub fn is_zero(&self) -> bool {
            self.0 == U1536::ZERO
        }
    }

    pub type SharedSecret = BigUint;

    /// `Keypair` is an ephemeral DH keypair.
    #[derive(Clone)]
    pub struct Keypair {
        private: Exponent,
        pub public: BigUint,
    }

    impl Drop for Keypair {
        fn drop(&mut self) {
            self.public.zeroize();
        }
    }

    impl Zeroize for Keypair {
        fn zeroize(&mut self) {
            self.private.zeroize();
            self.public.zeroize();
        }
    }

    impl Keypair {
        pub fn generate() -> Result<Self, CryptoError> {
            let private = Exponent::generate()?;
            let public = modpow_secret(&GENERATOR, &private);
            Ok(Self { private, public })
        }

        #[must_use]
        pub fn generate_shared_secret(&self, public_key: &BigUint) -> SharedSecret {
            modpow_secret(public_key, &self.private)
        }

        #[cfg(test)]
        pub(crate) fn private(&self) -> &Exponent {
            &self.private
        }
    }
}

pub mod aes128 {
    use aes_ctr::{
        cipher::{generic_array::GenericArray, NewStreamCipher, SyncStreamCipher},
        Aes128Ctr,
    };
    use zeroize::Zeroize;

    use crate::utils;

    use super::CryptoError;

    pub const KEY_LEN: usize = 16;

    #[derive(Clone)]
    pub struct Key(pub [u8; KEY_LEN]);

    impl Drop for Key {
        fn drop(&mut self) {
            self.0.zeroize();
        }
    }

    impl Key {
        pub fn generate() -> Result<Self, CryptoError> {
            Ok(Self(utils::random::secure_bytes::<KEY_LEN>()?))
        }

        #[must_use]
        pub fn encrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        #[must_use]
        pub fn decrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        /// crypt provides both encrypting and decrypting logic.
        fn crypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            let mut result = Vec::from(data);
            let key = GenericArray::from_slice(&self.0);
            let nonce = GenericArray::from_slice(nonce);
            let mut cipher = Aes128Ctr::new(key, nonce);
            cipher.apply_keystream(result.as_mut_slice());
            result
        }
    }
}

pub mod sha1 {
    pub const DIGEST_LEN: usize = 20;

    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }

    /// `digest_with_prefix` calculates `SHA1(b || data)`.
    #[must_use]
    pub fn digest_with_prefix(b: u8, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut context = ring::digest::Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
        context.update(&[b]);
        context.update(data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(context.finish().as_ref());
        result
    }

    /// `hmac` calculates the SHA1-HMAC value, used to authenticate data messages.
    #[must_use]
    pub fn hmac(key: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }
}

pub mod sha256 {
    pub const DIGEST_LEN: usize = 32;

    /// digest calculates the SHA256 digest value.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }

    /// `digest_with_prefix` calculates `SHA256(b || data)`.
    #[must_use]
    pub fn digest_with_prefix(b: u8, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut context = ring::digest::Context::new(&ring::digest::SHA256);
        context.update(&[b]);
        context.update(data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(context.finish().as_ref());
        result
    }

    /// hmac calculates the SHA256-HMAC value, using key 'm1' as documented in the OTRv3 protocol.
    #[must_use]
    pub fn hmac(m1: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m1);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }

    /// hmac160 calculates the first 160 bits of the SHA256-HMAC value, using key 'm2' as documented in the OTRv3 protocol.
    #[must_use]
    pub fn hmac160(m2: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m2);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.copy_from_slice(&digest.as_ref()[..20]);
        result
    }
}

pub mod constant {
    use num_bigint::BigUint;
    use ring::constant_time;

    use crate::utils;

    use super::{dh, CryptoError};

    /// `verify_bytes` compares two byte-slices in constant time.
    pub fn verify_bytes(expected: &[u8], actual: &[u8]) -> Result<(), CryptoError> {
        constant_time::verify_slices_are_equal(expected, actual).or(Err(
            CryptoError::VerificationFailure("Bytes do not match the expected value."),
        ))
    }

    /// `verify_biguint` compares two (at most 1536-bit) values in constant time, except for the
    /// size check.
    pub fn verify_biguint(expected: &BigUint, actual: &BigUint) -> Result<(), CryptoError> {
        if expected.bits() > dh::ELEMENT_LEN * 8 || actual.bits() > dh::ELEMENT_LEN * 8 {
            return Err(CryptoError::VerificationFailure(
                "Value is too large for comparison.",
            ));
        }
        verify_bytes(
            &utils::biguint::to_bytes_be_fixed::<{ dh::ELEMENT_LEN }>(expected),
            &utils::biguint::to_bytes_be_fixed::<{ dh::ELEMENT_LEN }>(actual),
        )
    }
}

pub mod dsa {
    use ::dsa::{
        signature::hazmat::{PrehashSigner, PrehashVerifier},
        Components, KeySize, SigningKey, VerifyingKey,
    };
    use num_bigint::BigUint;
    use rand::rngs::OsRng;

    use crate::encoding::OTREncoder;

    use super::{sha1, CryptoError};

    /// Length in bytes of the parameter `q`, and therefore of the prehash and signature parts.
    pub const PARAM_Q_LEN: usize = 20;

    pub type Signature = ::dsa::Signature;

    /// `Fingerprint` is the SHA1 hash over the encoded DSA public key, without the key type.
    pub type Fingerprint = [u8; sha1::DIGEST_LEN];

    /// `Keypair` is the long-term DSA keypair used to authenticate during AKE.
    pub struct Keypair {
        sk: SigningKey,
        pk: PublicKey,
    }

    impl Keypair {
        /// `generate` generates a new keypair including fresh domain parameters. Parameter
        /// generation takes considerable time.
        #[must_use]
        #[allow(deprecated)]
        pub fn generate() -> Self {
            Self::generate_with(Components::generate(&mut OsRng, KeySize::DSA_1024_160))
        }

        /// `generate_from_parameters` generates a new keypair for existing domain parameters.
        pub fn generate_from_parameters(
            p: BigUint,
            q: BigUint,
            g: BigUint,
        ) -> Result<Self, CryptoError> {
            let components = Components::from_components(p, q, g).or(Err(
                CryptoError::VerificationFailure("invalid DSA domain parameters"),
            ))?;
            Ok(Self::generate_with(components))
        }

        fn generate_with(components: Components) -> Self {
            let sk = SigningKey::generate(&mut OsRng, components);
            let pk = PublicKey(sk.verifying_key().clone());
            Self { sk, pk }
        }

        #[must_use]
        pub fn public_key(&self) -> &PublicKey {
            &self.pk
        }

        #[must_use]
        pub fn q(&self) -> &BigUint {
            self.pk.q()
        }

        /// `sign` signs the prehash (the value `M mod q`, as in OTR, not hashed again).
        pub fn sign(&self, prehash: &[u8; PARAM_Q_LEN]) -> Result<Signature, CryptoError> {
            self.sk
                .sign_prehash(prehash)
                .or(Err(CryptoError::VerificationFailure(
                    "failed to produce DSA signature",
                )))
        }
    }

    #[derive(Clone)]
    pub struct PublicKey(VerifyingKey);

    impl PublicKey {
        pub fn from_components(
            p: BigUint,
            q: BigUint,
            g: BigUint,
            y: BigUint,
        ) -> Result<Self, CryptoError> {
            let components = Components::from_components(p, q, g).or(Err(
                CryptoError::VerificationFailure("invalid DSA domain parameters"),
            ))?;
            VerifyingKey::from_components(components, y)
                .map(Self)
                .or(Err(CryptoError::VerificationFailure("invalid DSA public key")))
        }

        #[must_use]
        pub fn p(&self) -> &BigUint {
            self.0.components().p()
        }

        #[must_use]
        pub fn q(&self) -> &BigUint {
            self.0.components().q()
        }

        #[must_use]
        pub fn g(&self) -> &BigUint {
            self.0.components().g()
        }

        #[must_use]
        pub fn y(&self) -> &BigUint {
            self.0.y()
        }

        pub fn verify(
            &self,
            signature: &Signature,
            prehash: &[u8; PARAM_Q_LEN],
        ) -> Result<(), CryptoError> {
            self.0
                .verify_prehash(prehash, signature)
                .or(Err(CryptoError::VerificationFailure(
                    "DSA signature does not verify",
                )))
        }

        #[must_use]
        pub fn fingerprint(&self) -> Fingerprint {
            sha1::digest(
                &OTREncoder::new()
                    .write_mpi(self.p())
                    .write_mpi(self.q())
                    .write_mpi(self.g())
                    .write_mpi(self.y())
                    .to_vec(),
            )
        }
    }

    /// Fixed 1024/160 domain parameters for tests, to avoid slow parameter generation.
    #[cfg(test)]
    pub(crate) fn generate_test_keypair() -> Keypair {
        const P: &str = concat!(
            "83c3989f96951019f2db5f94de86bc4a2bbcf256b8b83312b17b1b0666f75214",
            "a1178a4cead90d9fdf36df808cf76d36ee658b1fd1ba59bcc3575f1c9d004f9f",
            "4d06c1a06b3b871a90f9a62efc8bca31e442ed7d9492af08dba904cf9361d613",
            "9f22f5149b76ef40647b23d347194044728db110223013054b000f7f115b74e9",
        );
        const Q: &str = "eeb4ba4ae5aa61f904407af4ed550dbb4adfc157";
        const G: &str = concat!(
            "50e25e70f8e3be9c53abfa1c23607f8aa502abe7ef8a670a004b09d203b87f31",
            "d4c1cbc9bb223a5b054d647d9a5b1c0ab596cc7c9ca484b2847f88713a3bb4b3",
            "da2ae0b66f94fe07c71c084cb735fb999e7c17bc82dbe5891d4697c10e63b5fd",
            "f427eadf5fcc3cb2a007ec6c26161076bbd4e0b3b389ec6c2726f84c7408a8ce",
        );
        Keypair::generate_from_parameters(
            BigUint::parse_bytes(P.as_bytes(), 16).unwrap(),
            BigUint::parse_bytes(Q.as_bytes(), 16).unwrap(),
            BigUint::parse_bytes(G.as_bytes(), 16).unwrap(),
        )
        .unwrap()
    }
}

/// `otr` contains the OTR-specific key derivations.
pub mod otr {
    use num_bigint::BigUint;
    use zeroize::Zeroize;

    use crate::{encoding::OTREncoder, SSID};

    use super::{aes128, sha1, sha256};

    /// `AKESecrets` are the secrets derived from the shared secret `s` during the AKE.
    pub struct AKESecrets {
        pub ssid: SSID,
        pub c: aes128::Key,
        pub cp: aes128::Key,
        pub m1: [u8; 32],
        pub m2: [u8; 32],
        pub m1p: [u8; 32],
        pub m2p: [u8; 32],
    }

    impl Drop for AKESecrets {
        fn drop(&mut self) {
            self.ssid.zeroize();
            self.m1.zeroize();
            self.m2.zeroize();
            self.m1p.zeroize();
            self.m2p.zeroize();
        }
    }

    impl AKESecrets {
        /// `derive` derives the AKE secrets from `secbytes`, the MPI-encoded shared secret.
        #[must_use]
        pub fn derive(secbytes: &[u8]) -> Self {
            let mut h2secret0 = sha256::digest_with_prefix(0x00, secbytes);
            let mut h2secret1 = sha256::digest_with_prefix(0x01, secbytes);
            let mut ssid = [0u8; 8];
            ssid.copy_from_slice(&h2secret0[..8]);
            let mut c = [0u8; aes128::KEY_LEN];
            c.copy_from_slice(&h2secret1[..16]);
            let mut cp = [0u8; aes128::KEY_LEN];
            cp.copy_from_slice(&h2secret1[16..]);
            h2secret0.zeroize();
            h2secret1.zeroize();
            Self {
                ssid,
                c: aes128::Key(c),
                cp: aes128::Key(cp),
                m1: sha256::digest_with_prefix(0x02, secbytes),
                m2: sha256::digest_with_prefix(0x03, secbytes),
                m1p: sha256::digest_with_prefix(0x04, secbytes),
                m2p: sha256::digest_with_prefix(0x05, secbytes),
            }
        }
    }

    /// `DataSecrets` are the keys for a single combination of our and their DH keys.
    pub struct DataSecrets {
        send_key: aes128::Key,
        send_mac: [u8; 20],
        receive_key: aes128::Key,
        receive_mac: [u8; 20],
        extra: [u8; 32],
    }

    impl Drop for DataSecrets {
        fn drop(&mut self) {
            self.send_mac.zeroize();
            self.receive_mac.zeroize();
            self.extra.zeroize();
        }
    }

    impl DataSecrets {
        #[must_use]
        pub fn derive(our_public: &BigUint, their_public: &BigUint, s: &BigUint) -> Self {
            let (sendbyte, recvbyte) = if our_public > their_public {
                (0x01, 0x02)
            } else {
                (0x02, 0x01)
            };
            let mut secbytes = OTREncoder::new().write_mpi(s).to_vec();
            let send_key = derive_key(sendbyte, &secbytes);
            let receive_key = derive_key(recvbyte, &secbytes);
            let send_mac = sha1::digest(&send_key.0);
            let receive_mac = sha1::digest(&receive_key.0);
            let extra = sha256::digest_with_prefix(0xff, &secbytes);
            secbytes.zeroize();
            Self {
                send_key,
                send_mac,
                receive_key,
                receive_mac,
                extra,
            }
        }

        #[must_use]
        pub fn send_key(&self) -> &aes128::Key {
            &self.send_key
        }

        #[must_use]
        pub fn send_mac(&self) -> &[u8; 20] {
            &self.send_mac
        }

        #[must_use]
        pub fn receive_key(&self) -> &aes128::Key {
            &self.receive_key
        }

        #[must_use]
        pub fn receive_mac(&self) -> &[u8; 20] {
            &self.receive_mac
        }

        #[must_use]
        pub fn extra_symmetric_key(&self) -> &[u8; 32] {
            &self.extra
        }
    }

    fn derive_key(b: u8, secbytes: &[u8]) -> aes128::Key {
        let mut digest = sha1::digest_with_prefix(b, secbytes);
        let mut key = [0u8; aes128::KEY_LEN];
        key.copy_from_slice(&digest[..aes128::KEY_LEN]);
        digest.zeroize();
        aes128::Key(key)
    }
}
