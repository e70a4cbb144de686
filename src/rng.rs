//! A small PCG32 generator for handshake nonces and session magic numbers.
//!
//! Nothing here is cryptographically secure. Seeding with
//! [`Pcg32::seed_from_u64`] gives reproducible handshakes in tests.

use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG-XSH-RR with 64-bit state and 32-bit output.
///
/// ```
/// use rollback_netplay::rng::Pcg32;
///
/// let mut a = Pcg32::seed_from_u64(7);
/// let mut b = Pcg32::seed_from_u64(7);
/// assert_eq!(a.next_u32(), b.next_u32());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Deterministic generator for a seed.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Generator seeded from the process hasher keys and the clock.
    #[must_use]
    pub fn from_entropy() -> Self {
        let mut hasher = RandomState::new().build_hasher();
        std::thread::current().id().hash(&mut hasher);
        if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            elapsed.as_nanos().hash(&mut hasher);
        }
        Self::seed_from_u64(hasher.finish())
    }

    /// Next 32 random bits.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// A random `u16` that is never zero. Zero marks "no magic yet" on the wire.
    #[must_use]
    pub fn next_nonzero_u16(&mut self) -> u16 {
        loop {
            let value = self.next_u32() as u16;
            if value != 0 {
                return value;
            }
        }
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Pcg32> = RefCell::new(Pcg32::from_entropy());
}

/// A random `u32` from the thread-local generator.
#[must_use]
pub fn random_u32() -> u32 {
    THREAD_RNG.with(|rng| rng.borrow_mut().next_u32())
}

/// Either a seeded generator or the thread-local one.
#[derive(Debug, Clone)]
pub(crate) enum NonceSource {
    Seeded(Pcg32),
    Thread,
}

impl NonceSource {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        seed.map_or(Self::Thread, |seed| Self::Seeded(Pcg32::seed_from_u64(seed)))
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        match self {
            Self::Seeded(rng) => rng.next_u32(),
            Self::Thread => random_u32(),
        }
    }

    pub(crate) fn next_magic(&mut self) -> u16 {
        match self {
            Self::Seeded(rng) => rng.next_nonzero_u16(),
            Self::Thread => THREAD_RNG.with(|rng| rng.borrow_mut().next_nonzero_u16()),
        }
    }
}
