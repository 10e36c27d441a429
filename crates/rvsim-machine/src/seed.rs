//! Initial-register randomisation.
//!
//! Guest programs must not learn to rely on zeroed registers at entry, so
//! x1..x31 start with pseudo-random bits. The stream is a SHA-512 expansion
//! of either the caller's seed (reproducible runs) or a time-derived default
//! mixed with 512 bits of host entropy.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use rvsim_cpu_core::CpuState;

/// Fill the integer registers with seeded noise and return 16 extra bytes
/// for the AT_RANDOM auxiliary-vector entry.
pub fn seed_registers(cpu: &mut CpuState, seed: Option<u64>) -> [u8; 16] {
    let mut material = Vec::with_capacity(8 + 64);
    match seed {
        Some(s) => material.extend_from_slice(&s.to_le_bytes()),
        None => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            material.extend_from_slice(&now.to_le_bytes());
            let mut entropy = [0u8; 64];
            OsRng.fill_bytes(&mut entropy);
            material.extend_from_slice(&entropy);
        }
    }

    let mut stream = KeyStream::new(&material);
    for r in 1..32 {
        cpu.set_x(r, stream.next_u64());
    }

    let mut at_random = [0u8; 16];
    at_random.copy_from_slice(&stream.next_block()[..16]);
    at_random
}

/// SHA-512 in counter mode over fixed seed material.
struct KeyStream<'a> {
    material: &'a [u8],
    counter: u64,
    block: [u8; 64],
    used: usize,
}

impl<'a> KeyStream<'a> {
    fn new(material: &'a [u8]) -> Self {
        let mut s = Self {
            material,
            counter: 0,
            block: [0; 64],
            used: 64,
        };
        s.refill();
        s
    }

    fn refill(&mut self) {
        let mut hasher = Sha512::new();
        hasher.update(self.material);
        hasher.update(self.counter.to_le_bytes());
        self.block.copy_from_slice(&hasher.finalize());
        self.counter += 1;
        self.used = 0;
    }

    fn next_u64(&mut self) -> u64 {
        if self.used + 8 > 64 {
            self.refill();
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.block[self.used..self.used + 8]);
        self.used += 8;
        u64::from_le_bytes(buf)
    }

    fn next_block(&mut self) -> [u8; 64] {
        self.refill();
        self.block
    }
}
