use rand::SeedableRng;
use rand::rngs::StdRng;

pub const STREAM_TRIAL: u64 = 0x5452_4941_4c00_0001;
// Keyed per outer trial.
pub const STREAM_GUARDRAIL: u64 = 0x4755_4152_4400_0002;
pub const STREAM_BACKTEST: u64 = 0x4241_434b_5400_0003;

/// Seed of item `index` on `stream`. A pure function of its inputs, so
/// results do not depend on which worker runs the item or when.
pub fn derive_seed(base_seed: u64, stream: u64, index: u64) -> u64 {
    let mixed = splitmix64(base_seed ^ stream);
    splitmix64(mixed ^ index.wrapping_mul(0xD1B5_4A32_D192_ED03))
}

pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

pub fn stream_rng(base_seed: u64, stream: u64, index: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(base_seed, stream, index))
}
