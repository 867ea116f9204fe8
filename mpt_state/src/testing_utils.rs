use ethereum_types::H256;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::nibbles::Nibbles;

pub(crate) fn common_setup() {
    // Try init since multiple tests calling `init` will cause an error.
    let _ = pretty_env_logger::try_init();
}

/// Seeded 32-byte-key entries; fixed-width keys match how the account and
/// storage layers key their tries.
pub(crate) fn random_fixed_key_entries(n: usize, seed: u64) -> Vec<(Nibbles, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut key = [0u8; 32];
            rng.fill_bytes(&mut key);
            let mut value = vec![0u8; rng.gen_range(1..=48)];
            rng.fill_bytes(&mut value);
            (Nibbles::from_h256_be(H256(key)), value)
        })
        .collect()
}
