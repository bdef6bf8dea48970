use std::sync::Arc;

use tracing::warn;

use crate::store::{CounterStore, StoreError};

// Human-typable alphabet: uppercase letters without the lookalikes I and O,
// digits without 0. Codes are six digits of this radix.
const ALPHABET: &[u8; 33] = b"ABCDEFGHJKLMNPQRSTUVWXYZ123456789";
const RADIX: u64 = ALPHABET.len() as u64;
pub const CODE_LENGTH: usize = 6;
/// Number of distinct codes before the counter wraps.
pub const CODE_SPACE: u64 = RADIX.pow(CODE_LENGTH as u32);

// Full-period linear congruential step: the multiplier is coprime to the
// code space (3^6 * 11^6), so the map is a bijection on [0, CODE_SPACE).
const MULTIPLIER: u64 = 48_271;
const INCREMENT: u64 = 12_345;

/// Allocates lobby codes by permuting a persisted monotonic counter, so
/// successive codes look unrelated but never collide until the space wraps.
pub struct CodeGenerator {
    counter: u64,
    seed: u64,
    store: Arc<dyn CounterStore>,
}

impl CodeGenerator {
    /// Loads the persisted counter and prepares the generator. The seed
    /// offsets the permutation; changing it breaks decode-compatibility of
    /// previously issued codes.
    pub async fn new(seed: u64, store: Arc<dyn CounterStore>) -> Result<Self, StoreError> {
        let counter = store.load_counter().await? % CODE_SPACE;
        Ok(Self {
            counter,
            seed: seed % CODE_SPACE,
            store,
        })
    }

    /// Returns the next lobby code, persisting the advanced counter.
    pub async fn next(&mut self) -> Result<String, StoreError> {
        let mixed = (self
            .counter
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT)
            .wrapping_add(self.seed))
            % CODE_SPACE;
        let code = encode(mixed);

        self.counter += 1;
        if self.counter >= CODE_SPACE {
            // From here on codes repeat the first cycle.
            warn!("lobby code counter wrapped; codes may collide");
            self.counter = 0;
        }
        self.store.save_counter(self.counter).await?;

        Ok(code)
    }
}

/// Encodes a value as six alphabet digits, most significant first.
pub fn encode(value: u64) -> String {
    let mut digits = [ALPHABET[0]; CODE_LENGTH];
    let mut rest = value % CODE_SPACE;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(rest % RADIX) as usize];
        rest /= RADIX;
    }
    // The alphabet is ASCII, so the digits are valid UTF-8.
    String::from_utf8_lossy(&digits).into_owned()
}

/// Decodes a code back to its permuted counter value. Diagnostics only.
pub fn decode(code: &str) -> Option<u64> {
    if code.len() != CODE_LENGTH {
        return None;
    }
    let mut value = 0u64;
    for byte in code.bytes() {
        let digit = ALPHABET.iter().position(|&c| c == byte)?;
        value = value * RADIX + digit as u64;
    }
    Some(value)
}

/// Checks length and alphabet membership.
pub fn valid(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| ALPHABET.contains(&b))
}
