//! Partially homomorphic encryption (Paillier) over fixed-point tensors.
//!
//! Ciphertexts support addition and plaintext multiplication but not general
//! multiplication, which bounds the operations the protocols can push into
//! ciphertext space. Every [`CipherMatrix`] carries the number of times the
//! fixed-point scale is baked into its plaintexts (`scale_pow`), so that a
//! missing or doubled rescale surfaces as a [`PheError::ScaleMismatch`]
//! instead of silently corrupted numerics.
//!
//! The keypair is an injected capability: a party either holds the full
//! cipher (public + private half) or a [`PheCipher::public_only`] copy.

use num::bigint::{BigInt, BigUint, ToBigInt};
use num::{Integer, One, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::IntMatrix;

/// Errors raised by cipher setup and homomorphic tensor operations.
#[derive(Debug, Error)]
pub enum PheError {
    /// A homomorphic operation combined ciphertexts at different fixed-point
    /// scales. This is a programming defect in the calling protocol, not a
    /// transient failure.
    #[error("fixed-point scale mismatch: ciphertexts at scale powers {a} and {b}")]
    ScaleMismatch {
        /// Scale power of the left operand.
        a: u32,
        /// Scale power of the right operand.
        b: u32,
    },
    /// Operand shapes are incompatible.
    #[error("shape mismatch: ({a_rows}x{a_cols}) vs ({b_rows}x{b_cols})")]
    ShapeMismatch {
        /// Rows of the left operand.
        a_rows: usize,
        /// Columns of the left operand.
        a_cols: usize,
        /// Rows of the right operand.
        b_rows: usize,
        /// Columns of the right operand.
        b_cols: usize,
    },
    /// Decryption was attempted without the private key half.
    #[error("this party only holds the public key half")]
    MissingPrivateKey,
    /// Key generation failed to produce a valid keypair.
    #[error("key generation failed: {0}")]
    KeyGeneration(&'static str),
}

/// Bit width of the statistical blinding masks drawn by
/// [`CipherMatrix::blind`]. Products of a 128-bit ring share with encoded
/// plaintexts stay far below this bound, and `mask + product` stays far
/// below `n / 2` for any supported key width.
pub const BLIND_BITS: u64 = 320;

/// The public half of a Paillier keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhePublicKey {
    n: BigUint,
    nn: BigUint,
}

/// The private half of a Paillier keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhePrivateKey {
    lambda: BigUint,
    mu: BigUint,
}

/// A Paillier cipher capability: always the public key, optionally the
/// private key of the designated decrypting party.
#[derive(Debug, Clone)]
pub struct PheCipher {
    /// The public key half, shared with every encrypting party.
    pub public: PhePublicKey,
    private: Option<PhePrivateKey>,
}

impl PheCipher {
    /// Generates a fresh keypair with an `n` of roughly `bits` bits.
    pub fn generate(bits: u64, rng: &mut impl Rng) -> Result<Self, PheError> {
        let p = generate_prime(bits / 2, rng);
        let mut q = generate_prime(bits / 2, rng);
        while q == p {
            q = generate_prime(bits / 2, rng);
        }
        let n = &p * &q;
        let nn = &n * &n;
        let lambda = (&p - 1u32).lcm(&(&q - 1u32));
        // with g = n + 1, L(g^lambda mod n^2) = lambda mod n
        let mu = mod_inverse(&(&lambda % &n), &n)
            .ok_or(PheError::KeyGeneration("lambda not invertible mod n"))?;
        Ok(Self {
            public: PhePublicKey { n, nn },
            private: Some(PhePrivateKey { lambda, mu }),
        })
    }

    /// A copy holding only the public key, for distribution to the
    /// encrypting parties.
    pub fn public_only(&self) -> Self {
        Self {
            public: self.public.clone(),
            private: None,
        }
    }

    /// Constructs the encrypt-only capability from a received public key.
    pub fn from_public(public: PhePublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// Whether this party can decrypt.
    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }

    /// Encrypts a fixed-point tensor carrying the scale `scale_pow` times.
    pub fn encrypt_matrix(
        &self,
        m: &IntMatrix,
        scale_pow: u32,
        rng: &mut impl Rng,
    ) -> CipherMatrix {
        let data = m
            .data()
            .iter()
            .map(|x| encrypt_value(&self.public, &embed(*x, &self.public.n), rng))
            .collect();
        CipherMatrix {
            rows: m.rows(),
            cols: m.cols(),
            scale_pow,
            data,
        }
    }

    /// Decrypts a ciphertext tensor back to its integer plaintexts, reduced
    /// into the `i128` share ring.
    ///
    /// The caller is responsible for decoding with the matching
    /// [`scale_pow`](CipherMatrix::scale_pow). The reduction is exact for
    /// plaintexts whose signed value fits `i128` and wraps mod 2^128
    /// otherwise, which is exactly what a ring share of a blinded tensor
    /// needs.
    pub fn decrypt_matrix(&self, c: &CipherMatrix) -> Result<IntMatrix, PheError> {
        let sk = self.private.as_ref().ok_or(PheError::MissingPrivateKey)?;
        let pk = &self.public;
        let mut data = Vec::with_capacity(c.data.len());
        for ct in &c.data {
            let x = ct.modpow(&sk.lambda, &pk.nn);
            let l = (&x - 1u32) / &pk.n;
            let m = (l * &sk.mu) % &pk.n;
            data.push(unembed(&m, &pk.n));
        }
        Ok(IntMatrix::from_vec(c.rows, c.cols, data))
    }
}

/// A matrix of Paillier ciphertexts under one public key, tagged with the
/// number of times the fixed-point scale is baked into its plaintexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherMatrix {
    rows: usize,
    cols: usize,
    scale_pow: u32,
    data: Vec<BigUint>,
}

impl CipherMatrix {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// How many times the fixed-point scale is carried by the plaintexts.
    pub fn scale_pow(&self) -> u32 {
        self.scale_pow
    }

    /// Homomorphic element-wise sum of two ciphertext tensors.
    pub fn add(&self, other: &Self, pk: &PhePublicKey) -> Result<Self, PheError> {
        if self.scale_pow != other.scale_pow {
            return Err(PheError::ScaleMismatch {
                a: self.scale_pow,
                b: other.scale_pow,
            });
        }
        self.check_same_shape(other.rows, other.cols)?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a * b) % &pk.nn)
            .collect();
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            scale_pow: self.scale_pow,
            data,
        })
    }

    /// Homomorphic element-wise sum with a plaintext tensor.
    ///
    /// The plaintext must be encoded at this ciphertext's scale power (or be
    /// a scale-free additive mask).
    pub fn add_plain(&self, plain: &IntMatrix, pk: &PhePublicKey) -> Result<Self, PheError> {
        self.check_same_shape(plain.rows(), plain.cols())?;
        let data = self
            .data
            .iter()
            .zip(plain.data())
            .map(|(c, p)| (c * (BigUint::one() + embed(*p, &pk.n) * &pk.n) % &pk.nn) % &pk.nn)
            .collect();
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            scale_pow: self.scale_pow,
            data,
        })
    }

    /// Homomorphic element-wise product with a singly encoded plaintext
    /// tensor of the same shape. The result carries the scale once more.
    pub fn hadamard_enc(&self, plain: &IntMatrix, pk: &PhePublicKey) -> Result<Self, PheError> {
        self.check_same_shape(plain.rows(), plain.cols())?;
        let data = self
            .data
            .iter()
            .zip(plain.data())
            .map(|(c, p)| c.modpow(&embed(*p, &pk.n), &pk.nn))
            .collect();
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            scale_pow: self.scale_pow + 1,
            data,
        })
    }

    /// Homomorphic product of every entry with one singly encoded scalar.
    /// The result carries the scale once more.
    pub fn scale_by(&self, factor_encoded: i128, pk: &PhePublicKey) -> Self {
        let e = embed(factor_encoded, &pk.n);
        let data = self.data.iter().map(|c| c.modpow(&e, &pk.nn)).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            scale_pow: self.scale_pow + 1,
            data,
        }
    }

    /// Multiplies every plaintext by the raw scale factor, lifting the tensor
    /// to the next scale power without changing its decoded value.
    pub fn lift(&self, scale: i128, pk: &PhePublicKey) -> Self {
        let e = embed(scale, &pk.n);
        let data = self.data.iter().map(|c| c.modpow(&e, &pk.nn)).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            scale_pow: self.scale_pow + 1,
            data,
        }
    }

    /// Homomorphic matrix product `self @ plain` with a singly encoded
    /// plaintext matrix. The result carries the scale once more.
    pub fn matmul_right(&self, plain: &IntMatrix, pk: &PhePublicKey) -> Result<Self, PheError> {
        if self.cols != plain.rows() {
            return Err(self.shape_error(plain.rows(), plain.cols()));
        }
        let (m, k, n) = (self.rows, self.cols, plain.cols());
        let mut data = Vec::with_capacity(m * n);
        for r in 0..m {
            for c in 0..n {
                let mut acc = BigUint::one();
                for l in 0..k {
                    let e = embed(plain.get(l, c), &pk.n);
                    acc = (acc * self.data[r * k + l].modpow(&e, &pk.nn)) % &pk.nn;
                }
                data.push(acc);
            }
        }
        Ok(Self {
            rows: m,
            cols: n,
            scale_pow: self.scale_pow + 1,
            data,
        })
    }

    /// Homomorphic matrix product `plain @ cipher` with a singly encoded
    /// plaintext matrix. The result carries the scale once more.
    pub fn matmul_left(plain: &IntMatrix, cipher: &Self, pk: &PhePublicKey) -> Result<Self, PheError> {
        if plain.cols() != cipher.rows {
            return Err(cipher.shape_error(plain.rows(), plain.cols()));
        }
        let (m, k, n) = (plain.rows(), plain.cols(), cipher.cols);
        let mut data = Vec::with_capacity(m * n);
        for r in 0..m {
            for c in 0..n {
                let mut acc = BigUint::one();
                for l in 0..k {
                    let e = embed(plain.get(r, l), &pk.n);
                    acc = (acc * cipher.data[l * n + c].modpow(&e, &pk.nn)) % &pk.nn;
                }
                data.push(acc);
            }
        }
        Ok(Self {
            rows: m,
            cols: n,
            scale_pow: cipher.scale_pow + 1,
            data,
        })
    }

    /// Blinds every entry with a fresh statistical mask and returns the
    /// blinded ciphertext together with this party's ring share of the
    /// masks.
    ///
    /// Decrypting the blinded tensor and reducing into the ring yields the
    /// complementary share: the two shares sum (wrapping) to the original
    /// plaintexts mod 2^128. Each mask is uniform over [`BLIND_BITS`] bits,
    /// which exceeds the magnitude of any product the protocols blind by a
    /// wide statistical margin, so the opened value reveals nothing about
    /// the plaintext beyond that margin.
    pub fn blind(&self, pk: &PhePublicKey, rng: &mut impl Rng) -> (Self, IntMatrix) {
        let mut data = Vec::with_capacity(self.data.len());
        let mut shares = Vec::with_capacity(self.data.len());
        let bound = BigUint::one() << BLIND_BITS;
        for c in &self.data {
            let mask = random_below(&bound, rng);
            let e = (&pk.n - (&mask % &pk.n)) % &pk.n;
            data.push((c * (BigUint::one() + e * &pk.n) % &pk.nn) % &pk.nn);
            shares.push(low_i128(&mask));
        }
        (
            Self {
                rows: self.rows,
                cols: self.cols,
                scale_pow: self.scale_pow,
                data,
            },
            IntMatrix::from_vec(self.rows, self.cols, shares),
        )
    }

    /// Homomorphic sum of all entries as a 1x1 ciphertext tensor.
    pub fn sum_elements(&self, pk: &PhePublicKey) -> Self {
        let mut acc = BigUint::one();
        for c in &self.data {
            acc = (acc * c) % &pk.nn;
        }
        Self {
            rows: 1,
            cols: 1,
            scale_pow: self.scale_pow,
            data: vec![acc],
        }
    }

    fn check_same_shape(&self, rows: usize, cols: usize) -> Result<(), PheError> {
        if self.rows != rows || self.cols != cols {
            return Err(self.shape_error(rows, cols));
        }
        Ok(())
    }

    fn shape_error(&self, rows: usize, cols: usize) -> PheError {
        PheError::ShapeMismatch {
            a_rows: self.rows,
            a_cols: self.cols,
            b_rows: rows,
            b_cols: cols,
        }
    }
}

/// Embeds a signed integer into `Z_n`, mapping negatives to the upper half.
fn embed(x: i128, n: &BigUint) -> BigUint {
    if x >= 0 {
        BigUint::from(x as u128) % n
    } else {
        n - (BigUint::from(x.unsigned_abs()) % n)
    }
}

/// The low 128 bits of a `BigUint`, reinterpreted as a two's-complement
/// ring element.
fn low_i128(x: &BigUint) -> i128 {
    let mut digits = x.iter_u64_digits();
    let lo = digits.next().unwrap_or(0) as u128;
    let hi = digits.next().unwrap_or(0) as u128;
    ((hi << 64) | lo) as i128
}

/// Inverse of [`embed`], reduced into the share ring: the upper half of
/// `Z_n` decodes as negative, and the signed value is taken mod 2^128.
///
/// Correct whenever the signed plaintext has magnitude below `n / 2`, which
/// every homomorphic combination in this crate satisfies for keys of 512
/// bits and up.
fn unembed(m: &BigUint, n: &BigUint) -> i128 {
    if *m > n / 2u32 {
        low_i128(m).wrapping_sub(low_i128(n))
    } else {
        low_i128(m)
    }
}

/// Encrypts one embedded plaintext: `(1 + m*n) * r^n mod n^2` with `g = n+1`.
fn encrypt_value(pk: &PhePublicKey, m: &BigUint, rng: &mut impl Rng) -> BigUint {
    let r = loop {
        let r = random_below(&pk.n, rng);
        if !r.is_zero() && r.gcd(&pk.n).is_one() {
            break r;
        }
    };
    let c = (BigUint::one() + m * &pk.n) % &pk.nn;
    (c * r.modpow(&pk.n, &pk.nn)) % &pk.nn
}

fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let m_big = m.to_bigint()?;
    let (mut r0, mut r1) = (m_big.clone(), a.to_bigint()?);
    let (mut t0, mut t1) = (BigInt::zero(), BigInt::one());
    while !r1.is_zero() {
        let q = &r0 / &r1;
        let r2 = &r0 - &q * &r1;
        r0 = std::mem::replace(&mut r1, r2);
        let t2 = &t0 - &q * &t1;
        t0 = std::mem::replace(&mut t1, t2);
    }
    if !r0.is_one() {
        return None;
    }
    (((t0 % &m_big) + &m_big) % &m_big).to_biguint()
}

fn random_biguint_bits(bits: u64, rng: &mut impl Rng) -> BigUint {
    let bytes = bits.div_ceil(8) as usize;
    let mut buf = vec![0u8; bytes];
    rng.fill(&mut buf[..]);
    let mut n = BigUint::from_bytes_be(&buf);
    // clamp to exactly `bits` bits with the top bit set
    let one = BigUint::one();
    n %= &one << bits;
    n |= &one << (bits - 1);
    n
}

fn random_below(n: &BigUint, rng: &mut impl Rng) -> BigUint {
    let bits = n.bits();
    loop {
        let bytes = bits.div_ceil(8) as usize;
        let mut buf = vec![0u8; bytes];
        rng.fill(&mut buf[..]);
        let candidate = BigUint::from_bytes_be(&buf) % (BigUint::one() << bits);
        if candidate < *n {
            return candidate;
        }
    }
}

const SMALL_PRIMES: [u32; 15] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47];

fn is_probable_prime(n: &BigUint, rounds: usize, rng: &mut impl Rng) -> bool {
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }
    let one = BigUint::one();
    let two = &one + &one;
    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;
    'witness: for _ in 0..rounds {
        let a = loop {
            let a = random_below(&n_minus_1, rng);
            if a >= two {
                break a;
            }
        };
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_1 {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn generate_prime(bits: u64, rng: &mut impl Rng) -> BigUint {
    loop {
        let candidate = random_biguint_bits(bits, rng) | BigUint::one();
        if is_probable_prime(&candidate, 25, rng) {
            return candidate;
        }
    }
}
