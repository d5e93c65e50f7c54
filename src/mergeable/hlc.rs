//! Hybrid logical clocks encoded as lexicographically sortable tokens.
//!
//! A token packs a 42-bit logical millisecond time, a 24-bit per-tick
//! counter, and a short client-identity suffix into 16 characters of a
//! base-64 alphabet ordered by ASCII value, so plain string comparison of
//! two tokens is equivalent to chronological comparison.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// An HLC token. The empty string means "unset".
pub type Time = String;

/// Sixty-four characters in ascending ASCII order.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 7;
const COUNTER_CHARS: usize = 4;
const CLIENT_CHARS: usize = 5;

const TIME_MASK: u64 = (1 << 42) - 1;
const COUNTER_MASK: u32 = (1 << 24) - 1;

fn encode_part(v: u64, chars: usize, out: &mut String) {
    for i in (0..chars).rev() {
        out.push(ALPHABET[((v >> (6 * i)) & 0x3f) as usize] as char);
    }
}

fn decode_part(s: &str) -> Option<u64> {
    s.bytes().try_fold(0u64, |acc, b| {
        ALPHABET
            .iter()
            .position(|&a| a == b)
            .map(|d| (acc << 6) | d as u64)
    })
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Derive the client suffix by hashing the store's unique id.
fn client_part(client_id: &str) -> String {
    let digest = Sha256::digest(client_id.as_bytes());
    let head = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let bits = head >> (64 - 6 * CLIENT_CHARS as u32);
    let mut out = String::with_capacity(CLIENT_CHARS);
    encode_part(bits, CLIENT_CHARS, &mut out);
    out
}

/// Split a token into its logical time and counter. `None` for malformed
/// tokens, including the empty "unset" time.
pub(crate) fn decode(time: &str) -> Option<(u64, u32)> {
    if !time.is_ascii() || time.len() != TIME_CHARS + COUNTER_CHARS + CLIENT_CHARS {
        return None;
    }
    let millis = decode_part(&time[..TIME_CHARS])?;
    let counter = decode_part(&time[TIME_CHARS..TIME_CHARS + COUNTER_CHARS])?;
    Some((millis, counter as u32))
}

/// The clock itself: monotonic over the wall clock, its own previous
/// output, and any time learned from a peer.
pub(crate) struct Hlc {
    last_millis: u64,
    counter: u32,
    client: String,
    now: Box<dyn FnMut() -> u64>,
}

impl Hlc {
    pub fn new(client_id: &str) -> Self {
        Self::with_now(client_id, Box::new(system_millis))
    }

    /// Use an injected millisecond source instead of the system clock.
    pub fn with_now(client_id: &str, now: Box<dyn FnMut() -> u64>) -> Self {
        Self {
            last_millis: 0,
            counter: 0,
            client: client_part(client_id),
            now,
        }
    }

    /// Generate the next timestamp, strictly greater than every one this
    /// clock has produced or seen.
    pub fn next(&mut self) -> Time {
        let wall = (self.now)() & TIME_MASK;
        if wall > self.last_millis {
            self.last_millis = wall;
            self.counter = 0;
        } else {
            self.counter = (self.counter + 1) & COUNTER_MASK;
            if self.counter == 0 {
                self.last_millis += 1;
            }
        }
        let mut out = String::with_capacity(TIME_CHARS + COUNTER_CHARS + CLIENT_CHARS);
        encode_part(self.last_millis, TIME_CHARS, &mut out);
        encode_part(self.counter as u64, COUNTER_CHARS, &mut out);
        out.push_str(&self.client);
        out
    }

    /// Fold a peer's timestamp into the clock so subsequent local stamps
    /// sort after it.
    pub fn seen(&mut self, time: &str) {
        let Some((millis, counter)) = decode(time) else {
            return;
        };
        if millis > self.last_millis || (millis == self.last_millis && counter > self.counter) {
            self.last_millis = millis;
            self.counter = counter;
        }
    }
}
