// SPDX-License-Identifier: LGPL-3.0-only

#![allow(clippy::trivially_copy_pass_by_ref)]

use bitflags::bitflags;
use num_bigint::BigUint;

use crate::{
    crypto::dsa,
    instancetag::{verify, InstanceTag},
    utils, OTRError, TLVType,
};

bitflags! {
    /// MessageFlag bit-flags can set for OTR-encoded messages.
    pub struct MessageFlags: u8 {
        /// FLAG_IGNORE_UNREADABLE indicates that the message can be ignored if it cannot be read.
        /// If set, no user-error is produced. This is used for control messages (SMP, heartbeats)
        /// that have no value to the user.
        const IGNORE_UNREADABLE = 0b0000_0001;
    }
}

/// `OTRDecoder` contains the logic for reading entries from byte-buffer.
///
/// Every read can fail due to unexpected end of data or unexpected content. The input originates
/// from the other party, so everything is handled as an `Err`-result.
pub struct OTRDecoder<'a>(&'a [u8]);

impl Drop for OTRDecoder<'_> {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            log::warn!("{} unread bytes left in discarded buffer", self.0.len());
        }
    }
}

impl<'a> OTRDecoder<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self(content)
    }

    pub fn read_u8(&mut self) -> Result<u8, OTRError> {
        log::trace!("read byte");
        Ok(self.read::<1>()?[0])
    }

    /// `read_u16` reads a short value (2 bytes, big-endian) from buffer.
    pub fn read_u16(&mut self) -> Result<u16, OTRError> {
        log::trace!("read short");
        Ok(u16::from_be_bytes(self.read::<2>()?))
    }

    /// `read_u32` reads an integer value (4 bytes, big-endian) from buffer.
    pub fn read_u32(&mut self) -> Result<u32, OTRError> {
        log::trace!("read int");
        Ok(u32::from_be_bytes(self.read::<4>()?))
    }

    pub fn read_instance_tag(&mut self) -> Result<InstanceTag, OTRError> {
        log::trace!("decode instance tag");
        verify(self.read_u32()?).or(Err(OTRError::ProtocolViolation("Illegal instance tag.")))
    }

    /// `read_data` reads variable-length data from buffer.
    pub fn read_data(&mut self) -> Result<Vec<u8>, OTRError> {
        log::trace!("decode DATA");
        let len = self.read_u32()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let mut data = Vec::with_capacity(len);
        self.transfer(len, &mut data);
        Ok(data)
    }

    /// `read_mpi` reads MPI from buffer.
    pub fn read_mpi(&mut self) -> Result<BigUint, OTRError> {
        log::trace!("decode MPI");
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok((*utils::biguint::ZERO).clone());
        }
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let mpi = BigUint::from_bytes_be(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(mpi)
    }

    /// `read_mpi_sequence` reads a counted sequence of MPI values, as used by SMP.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OTRError> {
        log::trace!("decode sequence of MPIs");
        let len = self.read_u32()? as usize;
        // every MPI takes at least 4 bytes, which bounds the allocation for hostile length values
        if self.0.len() / 4 < len {
            return Err(OTRError::IncompleteMessage);
        }
        let mut mpis = Vec::with_capacity(len);
        for _ in 0..len {
            mpis.push(self.read_mpi()?);
        }
        Ok(mpis)
    }

    /// `read_ctr` reads the top half of the counter value from buffer.
    pub fn read_ctr(&mut self) -> Result<[u8; CTR_LEN], OTRError> {
        log::trace!("decode CTR");
        self.read::<CTR_LEN>()
    }

    /// `read_mac` reads a MAC value from buffer.
    pub fn read_mac(&mut self) -> Result<[u8; MAC_LEN], OTRError> {
        log::trace!("decode MAC");
        self.read::<MAC_LEN>()
    }

    /// `read_public_key` reads a DSA public key from the buffer.
    pub fn read_public_key(&mut self) -> Result<dsa::PublicKey, OTRError> {
        log::trace!("decode DSA public key");
        let pktype = self.read_u16()?;
        if pktype != PUBLIC_KEY_TYPE_DSA {
            return Err(OTRError::ProtocolViolation(
                "Unsupported/invalid public key type.",
            ));
        }
        let p = self.read_mpi()?;
        let q = self.read_mpi()?;
        let g = self.read_mpi()?;
        let y = self.read_mpi()?;
        dsa::PublicKey::from_components(p, q, g, y).map_err(OTRError::CryptographicViolation)
    }

    pub fn read_dsa_signature(&mut self) -> Result<dsa::Signature, OTRError> {
        log::trace!("decode DSA signature");
        let r = self.read::<{ dsa::PARAM_Q_LEN }>()?;
        let s = self.read::<{ dsa::PARAM_Q_LEN }>()?;
        dsa::Signature::from_components(BigUint::from_bytes_be(&r), BigUint::from_bytes_be(&s))
            .or(Err(OTRError::ProtocolViolation("Invalid DSA signature.")))
    }

    pub fn read_tlvs(&mut self) -> Result<Vec<TLV>, OTRError> {
        log::trace!("decode all TLVs");
        let mut tlvs = Vec::new();
        while !self.0.is_empty() {
            tlvs.push(self.read_tlv()?);
        }
        Ok(tlvs)
    }

    /// `read_tlv` reads a type-length-value record from the content.
    pub fn read_tlv(&mut self) -> Result<TLV, OTRError> {
        log::trace!("decode TLV");
        let typ = self.read_u16()?;
        let len = self.read_u16()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let mut data = Vec::with_capacity(len);
        self.transfer(len, &mut data);
        Ok(TLV(typ, data))
    }

    /// `read_bytes_null_terminated` reads bytes until a NULL-byte is found or the buffer is empty.
    /// The NULL-byte is consumed, but will not be returned in the result.
    pub fn read_bytes_null_terminated(&mut self) -> Vec<u8> {
        log::trace!("decode until null-terminated or empty");
        let mut bytes = Vec::new();
        if let Some(pos) = self.0.iter().position(|b| *b == 0) {
            self.transfer(pos, &mut bytes);
            self.0 = &self.0[1..];
        } else {
            self.transfer(self.0.len(), &mut bytes);
        }
        bytes
    }

    pub fn read<const N: usize>(&mut self) -> Result<[u8; N], OTRError> {
        log::trace!("read {N} (fixed) bytes");
        if self.0.len() < N {
            return Err(OTRError::IncompleteMessage);
        }
        let mut buffer = [0u8; N];
        buffer.copy_from_slice(&self.0[..N]);
        self.0 = &self.0[N..];
        Ok(buffer)
    }

    fn transfer(&mut self, n: usize, buffer: &mut Vec<u8>) {
        log::trace!("read {n} (variable) bytes");
        buffer.extend_from_slice(&self.0[..n]);
        self.0 = &self.0[n..];
    }

    /// `done` can be used to express the end of decoding. The instance is consumed.
    pub fn done(self) -> Result<(), OTRError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(OTRError::ProtocolViolation("data remaining in buffer"))
        }
    }
}

pub trait OTREncodable {
    fn encode(&self, encoder: &mut OTREncoder);
}

pub struct OTREncoder {
    buffer: Vec<u8>,
}

impl OTREncoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write(&mut self, raw_bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(raw_bytes);
        self
    }

    pub fn write_encodable(&mut self, encodable: &dyn OTREncodable) -> &mut Self {
        encodable.encode(self);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buffer.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        assert!(u32::try_from(v.len()).is_ok());
        self.write_u32(v.len() as u32);
        self.buffer.extend_from_slice(v);
        self
    }

    /// Write sequence of MPI values in format defined in SMP: `num_mpis`, `mpi1`, `mpi2`, `...`
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        self.write_u32(mpis.len() as u32);
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    /// `write_mpi` writes the minimum-length encoding of the value, i.e. without leading zeroes.
    /// This is important when calculating public key fingerprints.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        if *v == *utils::biguint::ZERO {
            return self.write_u32(0);
        }
        let encoded = v.to_bytes_be();
        assert_ne!(
            0, encoded[0],
            "Assertion checking for minimum-length encoding has failed."
        );
        self.write_u32(encoded.len() as u32);
        self.write(&encoded)
    }

    pub fn write_ctr(&mut self, v: &[u8; CTR_LEN]) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mac(&mut self, v: &[u8; MAC_LEN]) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_public_key(&mut self, key: &dsa::PublicKey) -> &mut Self {
        self.write_u16(PUBLIC_KEY_TYPE_DSA)
            .write_mpi(key.p())
            .write_mpi(key.q())
            .write_mpi(key.g())
            .write_mpi(key.y())
    }

    /// `write_signature` writes the DSA signature as `r` and `s`, each 20 bytes, big-endian.
    pub fn write_signature(&mut self, sig: &dsa::Signature) -> &mut Self {
        self.write(&utils::biguint::to_bytes_be_fixed::<{ dsa::PARAM_Q_LEN }>(sig.r()))
            .write(&utils::biguint::to_bytes_be_fixed::<{ dsa::PARAM_Q_LEN }>(sig.s()))
    }

    /// `write_tlv` writes the TLV record.
    ///
    /// # Panics
    ///
    /// Panics if the value is larger than `TLV_MAX_VALUE_LEN`. The length must be checked before
    /// the TLV is written.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_tlv(&mut self, tlv: &TLV) -> &mut Self {
        assert!(
            tlv.1.len() <= TLV_MAX_VALUE_LEN,
            "BUG: TLV value exceeds maximum length"
        );
        self.write_u16(tlv.0).write_u16(tlv.1.len() as u16);
        self.buffer.extend(&tlv.1);
        self
    }

    pub fn write_bytes_null_terminated(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0u8);
        self
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }
}

/// CTR type represents the first half of the counter value used for encryption, which is
/// transmitted between communicating parties.
pub const CTR_LEN: usize = 8;
/// MAC type represents the 20-byte MAC value.
pub const MAC_LEN: usize = 20;

const PUBLIC_KEY_TYPE_DSA: u16 = 0x0000;

/// `TLV_MAX_VALUE_LEN` is the maximum length of a TLV value, as its length is encoded as a SHORT.
pub const TLV_MAX_VALUE_LEN: usize = u16::MAX as usize;

/// `TLV` is a type-length-value record carried inside the plaintext of a data message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub struct TLV(pub TLVType, pub Vec<u8>);
