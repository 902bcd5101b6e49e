use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::{
    create_iv, KeyContext, ReplayWindow, SessionKeys, SrtpError, AUTH_TAG_LENGTH,
    SRTCP_INDEX_LENGTH,
};
use crate::rtcp::{RtcpHeader, RTCP_HEADER_SIZE};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Bit set in the SRTCP index word when the packet payload is encrypted.
const E_FLAG: u32 = 1 << 31;

/// SRTCP transform for one RTCP stream.
///
/// Wire layout per RFC 3711: the 8-byte RTCP header and sender SSRC stay
/// in the clear, the payload is AES-CM encrypted, and the packet carries a
/// trailing 4-byte SRTCP index followed by a 10-byte truncated HMAC-SHA1
/// tag computed over everything before it.
///
/// ```text
/// +---------------+-------------------------------+--------+----------+
/// | RTCP header   | encrypted payload             | E+index| auth tag |
/// | (8 B, clear)  |                               | (4 B)  | (10 B)   |
/// +---------------+-------------------------------+--------+----------+
/// ```
///
/// Inbound packets are authenticated before any decryption output is
/// trusted, and checked against the replay window before being accepted.
/// The transform is owned by whichever handler runs it, which in this
/// pipeline means it lives on the processing thread and needs no locking.
pub struct Srtcp {
    keys: KeyContext,
    /// Cipher key length in use. Fixed at 16 for the AES-128 profiles.
    n_e: usize,
    /// Rollover counter mixed into every authentication tag.
    roc: u32,
    use_null_cipher: bool,
    replay: ReplayWindow,
}

impl Srtcp {
    pub fn new(keys: KeyContext) -> Self {
        Self {
            keys,
            n_e: super::AES_KEY_LENGTH,
            roc: 0,
            use_null_cipher: false,
            replay: ReplayWindow::new(),
        }
    }

    /// Disable the cipher, leaving authentication and replay protection in
    /// place. Matches the null-cipher session mode negotiated by some key
    /// agreements.
    pub fn set_null_cipher(&mut self, null: bool) {
        self.use_null_cipher = null;
    }

    pub fn set_roc(&mut self, roc: u32) {
        self.roc = roc;
    }

    fn keystream(
        &self,
        keys: &SessionKeys,
        ssrc: u32,
        seq: u32,
        buffer: &mut [u8],
    ) -> Result<(), SrtpError> {
        let iv = create_iv(ssrc, seq as u64, &keys.salt_key);
        let mut cipher = Aes128Ctr::new_from_slices(&keys.enc_key[..self.n_e], &iv)
            .map_err(|_| SrtpError::InvalidValue)?;
        cipher.apply_keystream(buffer);
        Ok(())
    }

    /// Encrypt an outbound buffer in place with the local session key.
    /// The caller passes exactly the region that should be covered by the
    /// keystream. No-op when the null cipher is configured.
    pub fn encrypt(&self, ssrc: u32, seq: u32, buffer: &mut [u8]) -> Result<(), SrtpError> {
        if self.use_null_cipher {
            return Ok(());
        }

        self.keystream(&self.keys.local, ssrc, seq, buffer)
    }

    /// Overwrite the last [`AUTH_TAG_LENGTH`] bytes of `buffer` with the
    /// truncated HMAC-SHA1 of everything before them, keyed with the local
    /// authentication key and bound to the rollover counter.
    pub fn add_auth_tag(&self, buffer: &mut [u8]) -> Result<(), SrtpError> {
        let len = buffer.len();
        if len < AUTH_TAG_LENGTH {
            return Err(SrtpError::InvalidValue);
        }

        let digest = self.auth_digest(&self.keys.local.auth_key, &buffer[..len - AUTH_TAG_LENGTH])?;
        buffer[len - AUTH_TAG_LENGTH..].copy_from_slice(&digest);
        Ok(())
    }

    /// Recompute the inbound tag with the remote authentication key and
    /// compare it in constant time, then check the replay window. The
    /// order matters: nothing about the packet is trusted until the tag
    /// matches, and a replayed packet is rejected before it is accepted.
    pub fn verify_auth_tag(&mut self, buffer: &[u8]) -> Result<(), SrtpError> {
        let len = buffer.len();
        if len < AUTH_TAG_LENGTH {
            return Err(SrtpError::InvalidValue);
        }

        let digest = self.auth_digest(&self.keys.remote.auth_key, &buffer[..len - AUTH_TAG_LENGTH])?;
        let received = &buffer[len - AUTH_TAG_LENGTH..];

        // Fold over every byte instead of bailing on the first mismatch.
        let diff = digest
            .iter()
            .zip(received)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            log::debug!("srtcp authentication tag mismatch");
            return Err(SrtpError::AuthTagMismatch);
        }

        if self.replay.observe(digest) {
            log::debug!("replayed srtcp packet discarded");
            return Err(SrtpError::Replayed);
        }

        Ok(())
    }

    /// Decrypt an inbound packet in place with the remote session key.
    /// The RTCP header and sender SSRC stay clear, and the keystream stops
    /// before the SRTCP index and the authentication tag.
    pub fn decrypt(&self, ssrc: u32, seq: u32, buffer: &mut [u8]) -> Result<(), SrtpError> {
        if self.use_null_cipher {
            return Ok(());
        }

        let size = buffer.len();
        let trailer = AUTH_TAG_LENGTH + SRTCP_INDEX_LENGTH;
        if size < RTCP_HEADER_SIZE + trailer {
            return Err(SrtpError::InvalidValue);
        }

        self.keystream(
            &self.keys.remote,
            ssrc,
            seq,
            &mut buffer[RTCP_HEADER_SIZE..size - trailer],
        )
    }

    /// Outbound counterpart of [`Srtcp::unprotect`]: stamp the SRTCP index
    /// (with the E flag when encrypting), encrypt the payload, and append
    /// the authentication tag. `buffer` must already reserve the
    /// `SRTCP_INDEX_LENGTH + AUTH_TAG_LENGTH` trailing bytes.
    pub fn protect(&self, seq: u32, buffer: &mut [u8]) -> Result<(), SrtpError> {
        let size = buffer.len();
        let trailer = AUTH_TAG_LENGTH + SRTCP_INDEX_LENGTH;
        if size < RTCP_HEADER_SIZE + trailer {
            return Err(SrtpError::InvalidValue);
        }

        let header = RtcpHeader::try_from(&buffer[..]).map_err(|_| SrtpError::InvalidValue)?;
        let seq = seq & !E_FLAG;
        self.encrypt(
            header.ssrc,
            seq,
            &mut buffer[RTCP_HEADER_SIZE..size - trailer],
        )?;

        let mut index = seq;
        if !self.use_null_cipher {
            index |= E_FLAG;
        }
        buffer[size - trailer..size - AUTH_TAG_LENGTH].copy_from_slice(&index.to_be_bytes());

        self.add_auth_tag(buffer)
    }

    /// Full inbound sequence for one protected packet: parse the header
    /// for the sender SSRC, read the SRTCP index from the trailer, verify
    /// the tag, check the replay window, then decrypt. Returns the
    /// plaintext length, which excludes the index and tag trailer.
    pub fn unprotect(&mut self, buffer: &mut [u8]) -> Result<usize, SrtpError> {
        let size = buffer.len();
        let trailer = AUTH_TAG_LENGTH + SRTCP_INDEX_LENGTH;
        if size < RTCP_HEADER_SIZE + trailer {
            return Err(SrtpError::InvalidValue);
        }

        let header = RtcpHeader::try_from(&buffer[..]).map_err(|_| SrtpError::InvalidValue)?;

        let index_at = size - trailer;
        let index = u32::from_be_bytes([
            buffer[index_at],
            buffer[index_at + 1],
            buffer[index_at + 2],
            buffer[index_at + 3],
        ]);

        self.verify_auth_tag(buffer)?;
        self.decrypt(header.ssrc, index & !E_FLAG, buffer)?;

        Ok(size - trailer)
    }

    fn auth_digest(&self, key: &[u8], data: &[u8]) -> Result<[u8; AUTH_TAG_LENGTH], SrtpError> {
        let mut mac = HmacSha1::new_from_slice(key).map_err(|_| SrtpError::InvalidValue)?;
        mac.update(data);
        mac.update(&self.roc.to_ne_bytes());

        let full = mac.finalize().into_bytes();
        let mut digest = [0u8; AUTH_TAG_LENGTH];
        digest.copy_from_slice(&full[..AUTH_TAG_LENGTH]);
        Ok(digest)
    }
}
