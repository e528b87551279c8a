//! Monotonic clock and the per-thread random generator.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Monotonic wall clock in seconds. Never goes backwards; the zero point is
/// arbitrary, only differences are meaningful.
pub fn clock() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// PCG32 (XSH-RR) generator. Each worker thread owns one state seeded from
/// the monotonic clock and its thread id, so concurrent workers draw
/// different scan orders and resample streams.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_MULT: u64 = 6364136223846793005;

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Pcg32 {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(PCG_MULT).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    pub fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    /// Uniform in `[0, bound)`. `bound` must be nonzero.
    pub fn below(&mut self, bound: usize) -> usize {
        // Multiply-shift keeps the modulo bias negligible for the bounds
        // used here (sample sizes, task counts).
        ((u64::from(self.next_u32()) * bound as u64) >> 32) as usize
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Pcg32> = RefCell::new(seed_thread_rng());
}

fn seed_thread_rng() -> Pcg32 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    let tid = hasher.finish();
    Pcg32::new(clock().to_bits(), tid)
}

/// Run `f` with the calling thread's generator.
pub fn with_thread_rng<T>(f: impl FnOnce(&mut Pcg32) -> T) -> T {
    THREAD_RNG.with(|rng| f(&mut rng.borrow_mut()))
}
