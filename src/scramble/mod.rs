//! Scramble traffic obfuscation.
//!
//! Obfuscation, not cryptography: each direction of a scrambled connection
//! is XORed with a 16-byte key that is rehashed after every 16 transformed
//! bytes. The two peers agree on keys by exchanging a burst of random noise
//! at connection start; each side derives its receive key from the noise it
//! received and its transmit key from the noise it sent.
//!
//! The noise burst carries its own length steganographically: the first two
//! 16-bit big-endian words of the burst AND together to the total length,
//! and the first byte is chosen to avoid every byte a passive classifier
//! could match against a known protocol.

use std::hash::Hasher;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use twox_hash::XxHash64;

use crate::error::{Error, Result};

/// First bytes of the protocols the dispatcher recognizes. Noise must never
/// start with one of these, or a passive observer could classify the burst.
pub const KNOWN_PROTOCOL_BYTES: [u8; 6] = [
    0x04, // socks4
    0x05, // socks5
    0x16, // TLS ClientHello
    0x43, // 'C'
    0x47, // 'G'
    0x50, // 'P'
];

/// Upper bound (exclusive) on the noise burst length.
pub const NOISE_MAX_LEN: usize = 0x0fff;

/// Noise burst length floor: the two length words themselves.
const NOISE_MIN_LEN: usize = 4;

const KEY_LEN: usize = 16;

fn xxh64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Derive a 16-byte key from arbitrary input: XXH64 of the input followed
/// by XXH64 of that first hash (hash-of-hash).
pub fn key_schedule(input: &[u8]) -> [u8; KEY_LEN] {
    let first = xxh64(input);
    let second = xxh64(&first.to_le_bytes());

    let mut key = [0u8; KEY_LEN];
    key[..8].copy_from_slice(&first.to_le_bytes());
    key[8..].copy_from_slice(&second.to_le_bytes());
    key
}

/// One direction of the scramble transform.
///
/// Starts invalid (identity transform). Once keyed, every byte is XORed
/// against the key; after 16 bytes the key is rehashed and the position
/// wraps.
#[derive(Clone)]
pub struct ScrambleState {
    key: [u8; KEY_LEN],
    pos: usize,
    valid: bool,
}

impl Default for ScrambleState {
    fn default() -> Self {
        Self {
            key: [0u8; KEY_LEN],
            pos: 0,
            valid: false,
        }
    }
}

impl ScrambleState {
    /// Key this direction and reset the position.
    pub fn set_key(&mut self, key: [u8; KEY_LEN]) {
        self.key = key;
        self.pos = 0;
        self.valid = true;
    }

    /// Whether the transform is active.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Transform `buf` in place. Encrypt and decrypt are the same
    /// operation.
    pub fn apply(&mut self, buf: &mut [u8]) {
        if !self.valid {
            return;
        }

        for byte in buf {
            *byte ^= self.key[self.pos];
            self.pos += 1;
            if self.pos == KEY_LEN {
                self.key = key_schedule(&self.key);
                self.pos = 0;
            }
        }
    }
}

/// Pick two 16-bit words whose AND equals `len` and whose leading byte is
/// not a known protocol byte.
fn noise_words(len: u16) -> (u16, u16) {
    loop {
        // Bits of `len` must be set in both words; the complement bits are
        // split disjointly between them so the AND cancels everything else.
        let free = !len;
        let split = OsRng.next_u32() as u16;
        let w0 = len | (free & split);
        let w1 = len | (free & !split & OsRng.next_u32() as u16);

        let first = (w0 >> 8) as u8;
        if !KNOWN_PROTOCOL_BYTES.contains(&first) {
            return (w0, w1);
        }
    }
}

fn generate_noise_with_len(len: usize) -> Vec<u8> {
    debug_assert!((NOISE_MIN_LEN..NOISE_MAX_LEN).contains(&len));

    let (w0, w1) = noise_words(len as u16);

    let mut noise = vec![0u8; len];
    noise[..2].copy_from_slice(&w0.to_be_bytes());
    noise[2..4].copy_from_slice(&w1.to_be_bytes());
    OsRng.fill_bytes(&mut noise[4..]);
    noise
}

/// Generate a noise burst of random length in `[4, max_len)`.
pub fn generate_noise(max_len: usize) -> Vec<u8> {
    let max_len = max_len.clamp(NOISE_MIN_LEN + 1, NOISE_MAX_LEN);
    let len = OsRng.gen_range(NOISE_MIN_LEN..max_len);
    generate_noise_with_len(len)
}

/// Read the peer's noise burst.
///
/// Words are consumed two bytes at a time; each consecutive pair is ANDed
/// and the first candidate landing in `[4, max_len)` fixes the total
/// length. Reading past `max_len` bytes without completing fails.
pub async fn read_noise<S>(stream: &mut S, max_len: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let max_len = max_len.clamp(NOISE_MIN_LEN + 1, NOISE_MAX_LEN);

    let mut received = Vec::with_capacity(256);
    let mut prev: u16 = 0;
    let mut cur: u16 = 0;
    let mut noise_len: Option<usize> = None;
    let mut chunk = 2usize;

    loop {
        let mut buf = [0u8; 2];
        stream
            .read_exact(&mut buf[..chunk])
            .await
            .map_err(|e| Error::scramble(format!("noise read: {e}")))?;
        received.extend_from_slice(&buf[..chunk]);

        if chunk == 2 {
            prev = cur;
            cur = u16::from_be_bytes(buf);
        }

        if received.len() >= max_len {
            return Err(Error::scramble("noise length cap reached"));
        }

        if let Some(len) = noise_len {
            chunk = (len - received.len()).min(2);
            if chunk == 0 {
                break;
            }
            continue;
        }

        // Length not yet known: the first pair pairs with the zero word and
        // always decodes out of range, so sliding starts at the second pair.
        // A candidate shorter than what is already consumed cannot complete
        // and is discarded.
        let candidate = (prev & cur) as usize;
        if candidate >= received.len() && (NOISE_MIN_LEN..max_len).contains(&candidate) {
            chunk = (candidate - received.len()).min(2);
            noise_len = Some(candidate);
            if chunk == 0 {
                break;
            }
        }
    }

    Ok(received)
}

/// Run the noise exchange on a raw stream: send our burst, read theirs.
///
/// `max_len` bounds only the burst we generate; the peer's burst is
/// accepted up to the protocol cap so differently tuned peers still pair.
/// Returns `(sent, received)`; the caller keys its transmit direction from
/// `sent` and its receive direction from `received`, so both peers end up
/// with matching key pairs.
pub async fn exchange_noise<S>(stream: &mut S, max_len: usize) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sent = generate_noise(max_len);
    stream
        .write_all(&sent)
        .await
        .map_err(|e| Error::scramble(format!("noise write: {e}")))?;

    let received = read_noise(stream, NOISE_MAX_LEN).await?;
    Ok((sent, received))
}
