// SPDX-License-Identifier: LGPL-3.0-only

use std::fmt::Debug;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

use crate::{
    encoding::{OTREncodable, OTREncoder},
    instancetag::{self, InstanceTag},
    utils, Version,
};

const OTR_FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";
const OTR_FRAGMENT_V3_PREFIX: &[u8] = b"?OTR|";
const OTR_FRAGMENT_SUFFIX: &[u8] = b",";

/// Overhead of the `OTRv2` fragment format: `?OTR,%05d,%05d,` and the trailing comma.
const OTRV2_HEADER_SIZE: usize = 18;
/// Overhead of the `OTRv3` fragment format: `?OTR|%08x|%08x,%05d,%05d,` and the trailing comma.
const OTRV3_HEADER_SIZE: usize = 36;

const INDEX_FIRST_FRAGMENT: u16 = 1;

/// OTR: "Start with the OTR message as you would normally transmit it. Break it up into
/// sufficiently small pieces. Let the number of pieces be (`n`), and the pieces be `piece[1]`,
/// `piece[2]`,`...`,`piece[n]`. Transmit (`n`) OTR version 3 fragmented messages with the following
/// (printf-like) structure (as `k` runs from `1` to `n` inclusive):
///
/// > `"?OTR|%x|%x,%hu,%hu,%s," , sender_instance, receiver_instance, k , n , piece[k]`
///
/// Note that `k` and `n` are unsigned short ints (`2` bytes), and each has a maximum value of
/// `65535`. Also, each `piece[k]` must be non-empty. The instance tags (if applicable) and the `k`
/// and `n` values may have leading zeroes.
static FRAGMENT_V3_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]*),$",
    )
    .expect("BUG: failed to compile hard-coded regex-pattern.")
});

/// The `OTRv2` fragment format is like `OTRv3` but without instance tags.
static FRAGMENT_V2_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR,(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]*),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});

/// `match_fragment` recognizes both `OTRv2` an`OTRv3` fragment patterns. This allows for a more
/// graceful control flow.
pub fn match_fragment(content: &[u8]) -> bool {
    (content.starts_with(OTR_FRAGMENT_V2_PREFIX) || content.starts_with(OTR_FRAGMENT_V3_PREFIX))
        && content.ends_with(OTR_FRAGMENT_SUFFIX)
}

/// `parse` parses fragments of both `OTRv2` and `OTRv3` format. Content that does not match the
/// exact structure results in `None`.
pub fn parse(content: &[u8]) -> Option<Fragment> {
    if let Some(captures) = (*FRAGMENT_V3_PATTERN).captures(content) {
        Some(Fragment {
            version: Version::V3,
            sender: instancetag::verify(parse_hex_tag(&captures, 1)?).ok()?,
            receiver: instancetag::verify(parse_hex_tag(&captures, 2)?).ok()?,
            part: parse_decimal(&captures, 3)?,
            total: parse_decimal(&captures, 4)?,
            payload: Vec::from(captures.get(5)?.as_bytes()),
        })
    } else if let Some(captures) = (*FRAGMENT_V2_PATTERN).captures(content) {
        Some(Fragment {
            version: Version::V2,
            sender: instancetag::INSTANCE_ZERO,
            receiver: instancetag::INSTANCE_ZERO,
            part: parse_decimal(&captures, 1)?,
            total: parse_decimal(&captures, 2)?,
            payload: Vec::from(captures.get(3)?.as_bytes()),
        })
    } else {
        None
    }
}

fn parse_hex_tag(captures: &Captures, idx: usize) -> Option<InstanceTag> {
    let bytes = hex::decode(as_sized_hexarray::<8>(captures.get(idx)?.as_bytes())).ok()?;
    Some(utils::u32::from_4byte_be(&bytes))
}

/// `parse_decimal` parses the index or total. Values that do not fit in `u16` are rejected.
fn parse_decimal(captures: &Captures, idx: usize) -> Option<u16> {
    std::str::from_utf8(captures.get(idx)?.as_bytes())
        .ok()?
        .parse::<u16>()
        .ok()
}

fn as_sized_hexarray<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut result = [b'0'; N];
    result[N - data.len()..].copy_from_slice(data);
    result
}

pub fn verify(fragment: &Fragment) -> Result<(), FragmentError> {
    if fragment.total == 0
        || fragment.part == 0
        || fragment.part > fragment.total
        || fragment.payload.is_empty()
    {
        Err(FragmentError::InvalidData)
    } else {
        Ok(())
    }
}

/// `fragment` partitions given content into wire-ready fragments of a specified maximum size.
///
/// The fragmentation overhead is part of the maximum size. What is left will be used for partial
/// (fragmented) content. Content is returned as-is, as a single message, if `max_size` is `0`, if
/// the content fits, or if `max_size` leaves no room for content after the overhead.
#[allow(clippy::cast_possible_truncation)]
pub fn fragment(
    max_size: usize,
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    content: &[u8],
) -> Vec<Vec<u8>> {
    if max_size == 0 || content.len() <= max_size {
        return vec![Vec::from(content)];
    }
    let overhead = match version {
        Version::V2 => OTRV2_HEADER_SIZE,
        Version::V3 => OTRV3_HEADER_SIZE,
        Version::None | Version::Unsupported(_) => return vec![Vec::from(content)],
    };
    if max_size <= overhead {
        log::warn!(
            "Maximum fragment size {} does not fit fragmentation overhead. Sending message unfragmented.",
            max_size
        );
        return vec![Vec::from(content)];
    }
    let fragment_size: usize = max_size - overhead;
    let num_fragments =
        content.len() / fragment_size + utils::usize::signum(content.len() % fragment_size);
    let Ok(total) = u16::try_from(num_fragments) else {
        log::warn!("Message requires too many fragments. Sending message unfragmented.");
        return vec![Vec::from(content)];
    };
    content
        .chunks(fragment_size)
        .enumerate()
        .map(|(idx, payload)| {
            let fragment = Fragment {
                version,
                sender,
                receiver,
                part: idx as u16 + 1,
                total,
                payload: Vec::from(payload),
            };
            OTREncoder::new().write_encodable(&fragment).to_vec()
        })
        .collect()
}

pub struct Fragment {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    part: u16,
    total: u16,
    payload: Vec<u8>,
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("version", &self.version)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("part", &self.part)
            .field("total", &self.total)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}

impl OTREncodable for Fragment {
    fn encode(&self, encoder: &mut OTREncoder) {
        log::trace!("Fragment to encode: {:?}", &self);
        // ensure that the fragments we send are valid. (used to capture internal logic errors)
        assert_ne!(self.part, 0);
        assert_ne!(self.total, 0);
        assert!(self.part <= self.total);
        assert!(!self.payload.is_empty());
        match self.version {
            Version::V3 => {
                assert!(instancetag::verify(self.sender).is_ok());
                assert_ne!(self.sender, 0);
                assert!(instancetag::verify(self.receiver).is_ok());
                // `part` and `total` are padded with prefix zeroes, as other clients do.
                encoder.write(OTR_FRAGMENT_V3_PREFIX).write(
                    format!(
                        "{:08x}|{:08x},{:05},{:05},",
                        &self.sender, &self.receiver, &self.part, &self.total
                    )
                    .as_bytes(),
                );
            }
            Version::V2 => {
                encoder
                    .write(OTR_FRAGMENT_V2_PREFIX)
                    .write(format!("{:05},{:05},", &self.part, &self.total).as_bytes());
            }
            Version::None | Version::Unsupported(_) => {
                panic!("BUG: unsupported version for fragment")
            }
        }
        encoder.write(&self.payload).write(OTR_FRAGMENT_SUFFIX);
    }
}

/// `Assembler` reassembles fragments that arrive in order.
///
/// The assembler is either empty, in progress (`0 < last < total`) or done. Upon completion the
/// content is handed off and the assembler is empty again.
pub struct Assembler {
    total: u16,
    last: u16,
    content: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            total: 0,
            last: 0,
            content: Vec::new(),
        }
    }

    /// `assemble` processes the fragment. On completion, the reassembled content is returned.
    /// Invalid fragments are rejected without affecting the assembler. A first fragment always
    /// starts over. Any other unexpected fragment discards the assembler's content.
    pub fn assemble(&mut self, fragment: &Fragment) -> Result<Vec<u8>, FragmentError> {
        verify(fragment)?;
        if fragment.part == INDEX_FIRST_FRAGMENT {
            self.total = fragment.total;
            self.last = 1;
            self.content.clone_from(&fragment.payload);
        } else if self.last > 0 && fragment.total == self.total && fragment.part == self.last + 1
        {
            self.last = fragment.part;
            self.content.extend(&fragment.payload);
        } else {
            log::debug!("Unexpected fragment encountered. Resetting assembler.");
            self.reset();
            return Err(FragmentError::UnexpectedFragment);
        }
        if self.last == self.total {
            self.total = 0;
            self.last = 0;
            Ok(std::mem::take(&mut self.content))
        } else {
            Err(FragmentError::IncompleteResult)
        }
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.last = 0;
        self.content.clear();
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.total == 0 && self.last == 0 && self.content.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragment contains invalid part information that would result in an invalid partitioning of
    /// the content.
    InvalidData,
    /// Incomplete result. Waiting for more fragments to arrive.
    IncompleteResult,
    /// Unexpected fragment received. Resetting assembler.
    UnexpectedFragment,
}
