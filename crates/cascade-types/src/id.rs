use std::sync::Mutex;

use crate::clock::Clock;

/// Crockford base32 alphabet used by the lexically-sortable id format.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// ULID-style id generator: 48-bit millisecond timestamp followed by 80 bits
/// of entropy, rendered as 26 Crockford base32 characters. Ids generated
/// within one process sort by creation time.
///
/// With a seed, entropy comes from a splitmix64 stream so tests produce
/// identical id sequences run to run.
pub struct IdGen {
    entropy: Mutex<Entropy>,
}

enum Entropy {
    Random,
    Seeded(u64),
}

impl IdGen {
    pub fn random() -> Self {
        Self {
            entropy: Mutex::new(Entropy::Random),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            entropy: Mutex::new(Entropy::Seeded(seed)),
        }
    }

    pub fn next(&self, clock: &dyn Clock) -> String {
        let timestamp_ms = clock.now().timestamp_millis().max(0) as u64;
        let entropy = self.next_entropy();
        encode(timestamp_ms, entropy)
    }

    fn next_entropy(&self) -> u128 {
        let mut guard = self.entropy.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            Entropy::Random => uuid::Uuid::new_v4().as_u128() & ((1u128 << 80) - 1),
            Entropy::Seeded(state) => {
                let hi = splitmix64(state);
                let lo = splitmix64(state);
                (((hi as u128) << 64) | lo as u128) & ((1u128 << 80) - 1)
            }
        }
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn encode(timestamp_ms: u64, entropy: u128) -> String {
    let value = ((timestamp_ms as u128 & ((1u128 << 48) - 1)) << 80) | entropy;
    let mut out = [0u8; 26];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 125 - (i * 5);
        let index = ((value >> shift) & 0x1F) as usize;
        *slot = ALPHABET[index];
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::Utc;

    #[test]
    fn ids_are_26_chars() {
        let clock = SystemClock::new();
        let id = IdGen::random().next(&clock);
        assert_eq!(id.len(), 26);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn seeded_generator_is_deterministic() {
        let clock = ManualClock::new(Utc::now());
        let a = IdGen::seeded(7);
        let b = IdGen::seeded(7);
        assert_eq!(a.next(&clock), b.next(&clock));
        assert_eq!(a.next(&clock), b.next(&clock));
    }

    #[test]
    fn ids_sort_by_time() {
        let clock = ManualClock::new(Utc::now());
        let ids = IdGen::seeded(1);
        let first = ids.next(&clock);
        clock.advance_ms(2);
        let second = ids.next(&clock);
        assert!(second > first);
    }
}
