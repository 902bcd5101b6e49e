//! ## Secure RTCP transforms
//!
//! [RFC 3711]: https://tools.ietf.org/html/rfc3711
//!
//! SRTP and SRTCP provide confidentiality, message authentication, and
//! replay protection for RTP and RTCP traffic. The cipher is AES in
//! counter mode (AES-CM) keyed per direction, authentication is a
//! truncated HMAC-SHA1 tag appended to each packet, and replay protection
//! rejects packets whose authentication tag was already accepted.
//!
//! This module holds the pieces shared by the transforms: session key
//! material, the AES-CM initialization vector construction, and the
//! replay window. The SRTCP transform itself lives in [`srtcp`].

pub mod srtcp;

use std::collections::VecDeque;

use ahash::AHashSet;
use thiserror::Error;

pub use srtcp::Srtcp;

pub const AES_KEY_LENGTH: usize = 16;
pub const SALT_LENGTH: usize = 16;
pub const IV_LENGTH: usize = 16;
/// HMAC-SHA1 output truncated per the AES_CM_128_HMAC_SHA1_80 profile.
pub const AUTH_TAG_LENGTH: usize = 10;
pub const SRTCP_INDEX_LENGTH: usize = 4;

/// How many recently accepted tag digests the replay window remembers.
const REPLAY_WINDOW_SIZE: usize = 512;

/// Packet-level rejections from the secure transforms. None of these are
/// fatal to a session; the offending packet is dropped and the stream
/// keeps flowing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SrtpError {
    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    #[error("replayed packet")]
    Replayed,

    #[error("invalid value")]
    InvalidValue,
}

/// Key material for one direction of a secured session.
#[derive(Clone)]
pub struct SessionKeys {
    pub enc_key: [u8; AES_KEY_LENGTH],
    pub auth_key: [u8; AES_KEY_LENGTH],
    pub salt_key: [u8; SALT_LENGTH],
}

/// Local and remote key material, as produced by key agreement.
#[derive(Clone)]
pub struct KeyContext {
    pub local: SessionKeys,
    pub remote: SessionKeys,
}

/// Build the AES-CM initialization vector for `(ssrc, index)`.
///
/// The layout follows the on-wire construction of RFC 3711 section 4.1.1:
/// the SSRC occupies bytes 4..8, the big-endian packet index ends at byte
/// 14, the session salt is XORed over the first 14 bytes, and the last two
/// bytes stay zero for the block counter.
///
/// # Unit Test
///
/// ```
/// use rtp_rx::srtp::create_iv;
///
/// let iv = create_iv(0xdeadbeef, 1, &[0x2b; 16]);
///
/// assert_eq!(iv, [
///     0x2b, 0x2b, 0x2b, 0x2b, 0xf5, 0x86, 0x95, 0xc4,
///     0x2b, 0x2b, 0x2b, 0x2b, 0x2b, 0x2a, 0x00, 0x00,
/// ]);
/// ```
pub fn create_iv(ssrc: u32, index: u64, salt: &[u8; SALT_LENGTH]) -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());

    for (i, byte) in index.to_be_bytes().into_iter().enumerate() {
        iv[6 + i] ^= byte;
    }

    for i in 0..14 {
        iv[i] ^= salt[i];
    }

    iv
}

/// Bounded record of recently accepted authentication tag digests.
///
/// A digest showing up twice means the exact packet was already accepted,
/// so the second copy is a replay. The window is bounded so a long-lived
/// session does not accumulate digests forever; once it is full the oldest
/// entry falls out as new ones are recorded.
pub(crate) struct ReplayWindow {
    seen: AHashSet<[u8; AUTH_TAG_LENGTH]>,
    order: VecDeque<[u8; AUTH_TAG_LENGTH]>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            seen: AHashSet::with_capacity(REPLAY_WINDOW_SIZE),
            order: VecDeque::with_capacity(REPLAY_WINDOW_SIZE),
        }
    }

    /// Record `digest`, reporting whether it was already present.
    pub fn observe(&mut self, digest: [u8; AUTH_TAG_LENGTH]) -> bool {
        if !self.seen.insert(digest) {
            return true;
        }

        self.order.push_back(digest);
        if self.order.len() > REPLAY_WINDOW_SIZE {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_window_reports_duplicates() {
        let mut window = ReplayWindow::new();
        assert!(!window.observe([1; AUTH_TAG_LENGTH]));
        assert!(!window.observe([2; AUTH_TAG_LENGTH]));
        assert!(window.observe([1; AUTH_TAG_LENGTH]));
    }

    #[test]
    fn replay_window_forgets_the_oldest_entry() {
        let mut window = ReplayWindow::new();

        let digest = |n: usize| {
            let mut d = [0u8; AUTH_TAG_LENGTH];
            d[..8].copy_from_slice(&(n as u64).to_be_bytes());
            d
        };

        for n in 0..=REPLAY_WINDOW_SIZE {
            assert!(!window.observe(digest(n)));
        }

        // Entry 0 has been evicted and is accepted again; a recent entry
        // is still rejected.
        assert!(!window.observe(digest(0)));
        assert!(window.observe(digest(REPLAY_WINDOW_SIZE)));
    }

    #[test]
    fn iv_uses_the_wire_layout() {
        let zero_salt = [0u8; SALT_LENGTH];
        let iv = create_iv(0x01020304, 0x0506, &zero_salt);

        let mut expected = [0u8; IV_LENGTH];
        expected[4..8].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        expected[12] = 0x05;
        expected[13] = 0x06;
        assert_eq!(iv, expected);
    }
}
