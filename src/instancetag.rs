// SPDX-License-Identifier: LGPL-3.0-only

use crate::{crypto::CryptoError, utils};

pub const INSTANCE_ZERO: InstanceTag = 0;
pub(crate) const INSTANCE_MIN_VALID: InstanceTag = 0x0000_0100;

/// `InstanceTag` represents a client instance tag. The instance tag is used to distinguish between
/// multiple clients using the same account. Introduced in OTR version 3, this tag allows treating
/// multiple (chat) clients operating on the same account independently.
///
/// Instance tag `0` (`INSTANCE_ZERO`) is reserved as it indicates the lack of an instance tag,
/// both for OTR version 2 and for messages sent before the receiver's tag is known.
pub type InstanceTag = u32;

/// `verify` checks that the tag is either zero or in the valid range.
pub fn verify(tag: u32) -> Result<InstanceTag, InstanceTagError> {
    if tag > INSTANCE_ZERO && tag < INSTANCE_MIN_VALID {
        Err(InstanceTagError::IllegalValue(tag))
    } else {
        Ok(tag)
    }
}

pub(crate) fn random_tag() -> Result<InstanceTag, CryptoError> {
    let mut value = [0u8; 4];
    loop {
        utils::random::fill_secure_bytes(&mut value)?;
        let num = utils::u32::from_4byte_be(&value);
        if num >= INSTANCE_MIN_VALID {
            return Ok(num);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InstanceTagError {
    /// As a safety-margin, the instance tags have a predefined invalid range (0, 256). 0 is
    /// excluded as it is used for backwards-compatibility.
    IllegalValue(u32),
}
