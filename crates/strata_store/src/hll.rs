//! HyperLogLog cardinality sketch backing PFADD/PFCOUNT.
//!
//! 2^14 registers. Small sets keep a sorted sparse list of
//! `(register, rho)` pairs and upgrade to the dense byte array once the
//! sparse form would stop paying for itself; the upgrade is purely
//! size-triggered, so replicas applying the same element stream converge on
//! identical bytes.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

const PRECISION: u32 = 14;
const REGISTERS: usize = 1 << PRECISION;
/// Sparse pair count beyond which the sketch switches to dense form.
const SPARSE_LIMIT: usize = 3000;

const TAG_SPARSE: u8 = 0;
const TAG_DENSE: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hll {
    /// Sorted `(register index, rho)` pairs, one per occupied register.
    Sparse(Vec<(u16, u8)>),
    Dense(Vec<u8>),
}

impl Hll {
    pub fn new() -> Self {
        Hll::Sparse(Vec::new())
    }

    /// Hash an element the way routing keys are hashed elsewhere in the node.
    pub fn hash_member(member: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(member);
        hasher.finish()
    }

    /// Record one element. Returns true when a register value grew.
    pub fn add(&mut self, member: &[u8]) -> bool {
        let hash = Self::hash_member(member);
        let register = (hash >> (64 - PRECISION)) as u16;
        let rest = hash << PRECISION;
        // The low bits shifted out act as the run-length sample; an all-zero
        // remainder caps rho at the register width.
        let rho = (rest.leading_zeros() + 1).min(64 - PRECISION + 1) as u8;
        self.update(register, rho)
    }

    fn update(&mut self, register: u16, rho: u8) -> bool {
        match self {
            Hll::Sparse(pairs) => {
                let changed = match pairs.binary_search_by_key(&register, |(r, _)| *r) {
                    Ok(pos) => {
                        if pairs[pos].1 < rho {
                            pairs[pos].1 = rho;
                            true
                        } else {
                            false
                        }
                    }
                    Err(pos) => {
                        pairs.insert(pos, (register, rho));
                        true
                    }
                };
                if pairs.len() > SPARSE_LIMIT {
                    self.upgrade();
                }
                changed
            }
            Hll::Dense(registers) => {
                let slot = &mut registers[register as usize];
                if *slot < rho {
                    *slot = rho;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn upgrade(&mut self) {
        if let Hll::Sparse(pairs) = self {
            let mut registers = vec![0u8; REGISTERS];
            for (register, rho) in pairs.iter() {
                registers[*register as usize] = *rho;
            }
            *self = Hll::Dense(registers);
        }
    }

    pub fn count(&self) -> u64 {
        let m = REGISTERS as f64;
        let (sum, zeros) = match self {
            Hll::Sparse(pairs) => {
                let occupied = pairs.len();
                let mut sum = (REGISTERS - occupied) as f64;
                for (_, rho) in pairs {
                    sum += 2f64.powi(-(*rho as i32));
                }
                (sum, (REGISTERS - occupied) as f64)
            }
            Hll::Dense(registers) => {
                let mut sum = 0f64;
                let mut zeros = 0f64;
                for rho in registers {
                    sum += 2f64.powi(-(*rho as i32));
                    if *rho == 0 {
                        zeros += 1.0;
                    }
                }
                (sum, zeros)
            }
        };

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let estimate = alpha * m * m / sum;
        // Linear counting in the small range where the raw estimator biases.
        if estimate <= 2.5 * m && zeros > 0.0 {
            return (m * (m / zeros).ln()).round() as u64;
        }
        estimate.round() as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Hll::Sparse(pairs) => {
                let mut out = Vec::with_capacity(1 + 4 + pairs.len() * 3);
                out.push(TAG_SPARSE);
                out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (register, rho) in pairs {
                    out.extend_from_slice(&register.to_be_bytes());
                    out.push(*rho);
                }
                out
            }
            Hll::Dense(registers) => {
                let mut out = Vec::with_capacity(1 + REGISTERS);
                out.push(TAG_DENSE);
                out.extend_from_slice(registers);
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(!raw.is_empty(), "empty hll payload");
        match raw[0] {
            TAG_SPARSE => {
                anyhow::ensure!(raw.len() >= 5, "short sparse hll header");
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&raw[1..5]);
                let count = u32::from_be_bytes(buf) as usize;
                anyhow::ensure!(raw.len() == 5 + count * 3, "short sparse hll body");
                let mut pairs = Vec::with_capacity(count);
                let mut offset = 5;
                for _ in 0..count {
                    let register = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
                    let rho = raw[offset + 2];
                    pairs.push((register, rho));
                    offset += 3;
                }
                Ok(Hll::Sparse(pairs))
            }
            TAG_DENSE => {
                anyhow::ensure!(raw.len() == 1 + REGISTERS, "bad dense hll length");
                Ok(Hll::Dense(raw[1..].to_vec()))
            }
            other => anyhow::bail!("unknown hll tag {other}"),
        }
    }
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}
