// rate.rs — Rational clock-domain rates
//
// A `Rate` is the number of samples a domain produces per sample of its
// reference domain, kept as a reduced fraction `up/down`. Local domain rates
// are relative to the enclosing domain; composed rates are relative to the
// base domain (1/1).
//
// Failure modes: composition overflow returns `None`; scaling a block size
// that does not divide evenly returns a `BlockFault`.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reduced rational rate `up/down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rate {
    pub up: u32,
    pub down: u32,
}

/// A block size that became fractional while descending a domain chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFault {
    /// Index into the chain of the hop that failed.
    pub hop: usize,
    /// Numerator before division at the failing hop.
    pub numer: u64,
    /// Divisor at the failing hop.
    pub denom: u64,
}

impl Rate {
    pub const BASE: Rate = Rate { up: 1, down: 1 };

    /// Build a rate without reducing it. Use `reduced` for normal form.
    pub const fn new(up: u32, down: u32) -> Self {
        Rate { up, down }
    }

    pub fn upsample(n: u32) -> Self {
        Rate { up: n, down: 1 }
    }

    pub fn downsample(n: u32) -> Self {
        Rate { up: 1, down: n }
    }

    /// Lowest-terms form. Zero factors are returned unchanged.
    pub fn reduced(self) -> Self {
        if self.up == 0 || self.down == 0 {
            return self;
        }
        let g = gcd(self.up as u64, self.down as u64) as u32;
        Rate {
            up: self.up / g,
            down: self.down / g,
        }
    }

    pub fn is_coprime(self) -> bool {
        self.up > 0 && self.down > 0 && gcd(self.up as u64, self.down as u64) == 1
    }

    /// True for a pure integer upsample or downsample (or identity).
    pub fn is_integral_hop(self) -> bool {
        self.up == 1 || self.down == 1
    }

    /// Compose `self` (outer) with `inner` (relative to `self`), reduced.
    pub fn compose(self, inner: Rate) -> Option<Rate> {
        let up = self.up as u64 * inner.up as u64;
        let down = self.down as u64 * inner.down as u64;
        let (up, down) = reduce_ratio(up, down);
        Some(Rate {
            up: u32::try_from(up).ok()?,
            down: u32::try_from(down).ok()?,
        })
    }

    /// Sample period in base ticks per sample (the reciprocal rate).
    pub fn period(self) -> Rate {
        Rate {
            up: self.down,
            down: self.up,
        }
        .reduced()
    }

    /// Scale a count by this rate if the result is integral.
    pub fn scale(self, n: u64) -> Option<u64> {
        let num = n.checked_mul(self.up as u64)?;
        if num % self.down as u64 != 0 {
            return None;
        }
        Some(num / self.down as u64)
    }
}

impl Default for Rate {
    fn default() -> Self {
        Rate::BASE
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.up, self.down)
    }
}

/// Scale a base-rate block size down a chain of local rates, outermost first,
/// requiring an integral size after every hop.
pub fn scale_along_chain(base_block: u64, chain: &[Rate]) -> Result<u64, BlockFault> {
    let mut block = base_block;
    for (hop, rate) in chain.iter().enumerate() {
        let numer = block * rate.up as u64;
        let denom = rate.down as u64;
        if denom == 0 || numer % denom != 0 {
            return Err(BlockFault { hop, numer, denom });
        }
        block = numer / denom;
    }
    Ok(block)
}

pub fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

pub fn reduce_ratio(num: u64, den: u64) -> (u64, u64) {
    if num == 0 || den == 0 {
        return (num, den);
    }
    let g = gcd(num, den);
    (num / g, den / g)
}
