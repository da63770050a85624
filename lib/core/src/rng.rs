//! Deterministic PRNGs used by the trainable components.
//!
//! Each component pins a specific generator so that retraining or rebuilding
//! with the same seed yields bit-identical state: xorshift32 for k-means
//! initialization, xorshift64 (with Box-Muller) for LSH hyperplanes, and
//! xoshiro256** for the MUVERA projection matrices. The state transitions
//! here are frozen; changing them silently invalidates every persisted
//! artifact trained with the old streams.

/// 32-bit xorshift generator. Used by codebook training.
#[derive(Debug, Clone)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    /// A zero seed would get stuck; map it to an arbitrary nonzero constant.
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x9E3779B9 } else { seed },
        }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

/// 64-bit xorshift generator with a Box-Muller gaussian transform.
/// Used to draw LSH hyperplanes.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed },
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    pub fn next_uniform(&mut self) -> f32 {
        self.next_u64() as f32 / u64::MAX as f32
    }

    /// Standard-normal sample via Box-Muller (cosine branch only).
    pub fn next_gaussian(&mut self) -> f32 {
        let mut u1 = self.next_uniform();
        let u2 = self.next_uniform();
        if u1 < 1e-9 {
            u1 = 1e-9;
        }
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}

/// xoshiro256** generator, seeded from a single u64 via SplitMix64.
/// Used for MUVERA sign vectors and projection matrices.
#[derive(Debug, Clone)]
pub struct Xoshiro256 {
    s: [u64; 4],
}

impl Xoshiro256 {
    pub fn new(seed: u64) -> Self {
        // SplitMix64 expands the single seed into the 4 state words.
        let mut sm = seed;
        let mut s = [0u64; 4];
        for word in &mut s {
            sm = sm.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = sm;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            *word = z ^ (z >> 31);
        }
        Self { s }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let result = self.s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Random sign: +1.0 or -1.0 with equal probability.
    #[inline]
    pub fn next_sign(&mut self) -> f32 {
        if self.next_u64() & 1 == 1 {
            1.0
        } else {
            -1.0
        }
    }

    /// Uniform float derived from the top 24 bits of the next output.
    #[inline]
    pub fn next_uniform(&mut self) -> f32 {
        let v = self.next_u64();
        ((v >> 40) as f32 / (1u64 << 24) as f32) - 1.0
    }
}
