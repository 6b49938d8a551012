use rand::Rng;

use super::error::{SimError, SimResult};
use super::history::HistoricalReturns;
use super::types::ReturnRecord;

#[derive(Debug, Clone)]
pub struct SampledPath {
    pub records: Vec<ReturnRecord>,
    pub block_lengths: Vec<u32>,
}

/// Draws synthetic paths as concatenated runs of contiguous historical
/// years. `min_block == max_block == 1` is the plain i.i.d. bootstrap.
#[derive(Debug, Clone, Copy)]
pub struct BlockBootstrap<'a> {
    source: &'a [ReturnRecord],
    min_block: usize,
    max_block: usize,
}

impl<'a> BlockBootstrap<'a> {
    pub fn new(
        history: &'a HistoricalReturns,
        data_start_year: i32,
        min_block: u32,
        max_block: u32,
    ) -> SimResult<Self> {
        if min_block == 0 || min_block > max_block {
            return Err(SimError::config(format!(
                "block bounds must satisfy 1 <= min_block <= max_block, got {min_block}..={max_block}"
            )));
        }
        let source = history.slice_from(data_start_year);
        if source.len() < min_block as usize {
            return Err(SimError::config(format!(
                "available history from {data_start_year} spans {} years, shorter than min_block {min_block}",
                source.len()
            )));
        }
        Ok(Self {
            source,
            min_block: min_block as usize,
            max_block: max_block as usize,
        })
    }

    pub fn source(&self) -> &'a [ReturnRecord] {
        self.source
    }

    /// Samples a path of exactly `len` years. The last block is cut to the
    /// remaining length when that is shorter than `min_block`.
    pub fn sample<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> SampledPath {
        let span = self.source.len();
        let mut records = Vec::with_capacity(len);
        let mut block_lengths = Vec::new();

        while records.len() < len {
            let remaining = len - records.len();
            let upper = self.max_block.min(remaining).min(span);
            let lower = self.min_block.min(upper);
            let block = rng.gen_range(lower..=upper);
            let start = rng.gen_range(0..=span - block);
            records.extend_from_slice(&self.source[start..start + block]);
            block_lengths.push(block as u32);
        }

        SampledPath {
            records,
            block_lengths,
        }
    }
}
