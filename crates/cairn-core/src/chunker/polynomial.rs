use std::fmt;
use std::ops::{Add, Div, Rem};

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CairnError, Result};

/// Degree of every repository chunker polynomial.
const POL_DEGREE: i32 = 53;

/// Attempts before giving up on finding an irreducible polynomial.
const MAX_RANDOM_TRIES: usize = 1_000_000;

/// A polynomial over GF(2). Bit `i` of the inner value is the coefficient
/// of `x^i`, so addition is XOR and the degree is the highest set bit.
///
/// Each repository carries one random irreducible polynomial of degree 53
/// which keys the chunker's rolling hash, so chunk boundaries differ between
/// repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pol(pub u64);

impl Pol {
    pub const ZERO: Pol = Pol(0);
    pub const ONE: Pol = Pol(1);

    /// Degree of the polynomial, -1 for the zero polynomial.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    /// Multiplication modulo `m`, computed shift-and-add with a reduction at
    /// every doubling so intermediate values never overflow 64 bits.
    pub fn mulmod(self, rhs: Pol, m: Pol) -> Pol {
        debug_assert!(m.0 != 0, "modulus must be non-zero");
        let mut res = Pol::ZERO;
        let mut a = self % m;
        let mut b = (rhs % m).0;
        while b != 0 {
            if b & 1 == 1 {
                res = res + a;
            }
            b >>= 1;
            // a := a * x mod m
            a = Pol(a.0 << 1);
            if a.deg() == m.deg() {
                a = a + m;
            }
        }
        res
    }

    /// Greatest common divisor via Euclid's algorithm.
    pub fn gcd(self, other: Pol) -> Pol {
        let (mut a, mut b) = (self, other);
        while b != Pol::ZERO {
            let r = a % b;
            a = b;
            b = r;
        }
        a
    }

    /// Irreducibility test after Ben-Or: `f` of degree d is irreducible iff
    /// `gcd(f, x^(2^i) + x mod f) == 1` for all `1 <= i <= d/2`.
    pub fn irreducible(self) -> bool {
        if self.deg() < 1 {
            return false;
        }
        for i in 1..=(self.deg() / 2) {
            if self.gcd(qp(i as u32, self)) != Pol::ONE {
                return false;
            }
        }
        true
    }

    /// Generate a random irreducible polynomial of degree 53 from OS entropy.
    pub fn random() -> Result<Pol> {
        let mut rng = rand::rngs::OsRng;
        for _ in 0..MAX_RANDOM_TRIES {
            // Force degree 53 and a non-zero constant term (every irreducible
            // polynomial other than x has one).
            let f = (rng.next_u64() & ((1 << POL_DEGREE) - 1)) | (1 << POL_DEGREE) | 1;
            let candidate = Pol(f);
            if candidate.irreducible() {
                return Ok(candidate);
            }
        }
        Err(CairnError::Other(
            "unable to find an irreducible chunker polynomial".into(),
        ))
    }

    pub fn from_hex(s: &str) -> Result<Pol> {
        u64::from_str_radix(s, 16)
            .map(Pol)
            .map_err(|e| CairnError::InvalidFormat(format!("invalid chunker polynomial '{s}': {e}")))
    }

    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }
}

/// Compute `x^(2^p) + x mod g`.
fn qp(p: u32, g: Pol) -> Pol {
    let mut res = Pol(2); // the polynomial x
    for _ in 0..p {
        res = res.mulmod(res, g);
    }
    res + Pol(2)
}

impl Add for Pol {
    type Output = Pol;
    fn add(self, rhs: Pol) -> Pol {
        Pol(self.0 ^ rhs.0)
    }
}

impl Rem for Pol {
    type Output = Pol;
    fn rem(self, m: Pol) -> Pol {
        debug_assert!(m.0 != 0, "remainder by zero polynomial");
        let mut r = self.0;
        let dm = m.deg();
        while Pol(r).deg() >= dm {
            r ^= m.0 << (Pol(r).deg() - dm);
        }
        Pol(r)
    }
}

impl Div for Pol {
    type Output = Pol;
    fn div(self, m: Pol) -> Pol {
        debug_assert!(m.0 != 0, "division by zero polynomial");
        let mut q = 0u64;
        let mut r = self.0;
        let dm = m.deg();
        while Pol(r).deg() >= dm {
            let shift = Pol(r).deg() - dm;
            q |= 1 << shift;
            r ^= m.0 << shift;
        }
        Pol(q)
    }
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// The polynomial appears in the repository config as a hex string.
impl Serialize for Pol {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Pol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pol::from_hex(&s).map_err(D::Error::custom)
    }
}

/// A known irreducible polynomial of degree 53, shared by tests that need a
/// fixed chunker keying.
#[cfg(test)]
pub(crate) const TEST_POL: Pol = Pol(0x3DA3358B4DC173);
