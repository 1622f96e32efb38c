// SPDX-License-Identifier: LGPL-3.0-only

pub mod alloc {
    #[must_use]
    pub fn vec_unique<T: Ord>(mut src: Vec<T>) -> Vec<T> {
        src.sort_unstable();
        src.dedup();
        src
    }
}

pub mod bytes {
    use std::cmp::Ordering;

    #[must_use]
    pub fn any_nonzero(data: &[u8]) -> bool {
        !all_zero(data)
    }

    #[must_use]
    pub fn all_zero(data: &[u8]) -> bool {
        data.iter().all(|b| *b == 0)
    }

    #[must_use]
    pub fn drop_by_value(data: &[u8], v: u8) -> Vec<u8> {
        data.iter().copied().filter(|b| *b != v).collect()
    }

    /// `cmp` compares two equal-length byte-slices for each pair of values by index.
    ///
    /// # Panics
    ///
    /// Will panic when two references to the same slice are provided, or slices of different
    /// length.
    #[must_use]
    pub fn cmp(data1: &[u8], data2: &[u8]) -> Ordering {
        // guard against accidentally comparing the same reference against itself. Apart from the
        // obvious result, it may be indicative of a programming error.
        assert!(!core::ptr::eq(data1, data2));
        assert_eq!(data1.len(), data2.len());
        for i in 0..data1.len() {
            if data1[i] < data2[i] {
                return Ordering::Less;
            }
            if data1[i] > data2[i] {
                return Ordering::Greater;
            }
        }
        Ordering::Equal
    }
}

pub mod u32 {
    #[must_use]
    pub fn from_4byte_be(bytes: &[u8]) -> u32 {
        assert_eq!(bytes.len(), 4);
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// `nonzero` tests if provided value is a non-zero value. Returns `None` if it was zero or
    /// `Option<value>` if larger.
    #[must_use]
    pub fn nonzero(value: u32) -> Option<u32> {
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }

    /// `verify_nonzero` produces the provided error if `value` is zero.
    pub fn verify_nonzero<E>(value: u32, error: E) -> Result<(), E> {
        if value == 0 {
            Err(error)
        } else {
            Ok(())
        }
    }
}

pub mod usize {
    #[must_use]
    pub fn signum(value: usize) -> usize {
        usize::from(value > 0)
    }
}

pub mod biguint {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    pub static ZERO: Lazy<BigUint> = Lazy::new(|| BigUint::from(0u8));
    pub static ONE: Lazy<BigUint> = Lazy::new(|| BigUint::from(1u8));
    pub static TWO: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// `to_bytes_be_fixed` encodes `value` big-endian, left-padded with zeroes to exactly `N` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `value` does not fit in `N` bytes.
    #[must_use]
    pub fn to_bytes_be_fixed<const N: usize>(value: &BigUint) -> [u8; N] {
        let encoded = value.to_bytes_be();
        assert!(encoded.len() <= N, "BUG: value does not fit in fixed-size buffer");
        let mut result = [0u8; N];
        result[N - encoded.len()..].copy_from_slice(&encoded);
        result
    }
}

pub mod random {
    use once_cell::sync::Lazy;
    use ring::rand::{SecureRandom, SystemRandom};

    use crate::crypto::CryptoError;

    static RAND: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

    /// `fill_secure_bytes` fills the provided buffer with secure random bytes. Failure of the
    /// system random source is reported, not silently ignored.
    pub fn fill_secure_bytes(buffer: &mut [u8]) -> Result<(), CryptoError> {
        (*RAND)
            .fill(buffer)
            .map_err(|_| CryptoError::RandomnessFailure)
    }

    /// `secure_bytes` produces an array of `N` secure random bytes.
    pub fn secure_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
        let mut buffer = [0u8; N];
        fill_secure_bytes(&mut buffer)?;
        Ok(buffer)
    }
}
