use std::collections::BTreeMap;

use crate::data::histogram::SectorKey;

/// Running per-sector statistics of located pad peaks, used as the
/// normalization reference for gain computation.
///
/// An accumulator is created lazily on the first contributing pad. Pads
/// excluded by peak location never contribute, so sparse pads cannot
/// skew the reference. The average is computed lazily; a sector nobody
/// contributed to has no defined average and reports `None`.
#[derive(Clone, Debug, Default)]
pub struct SectorAverages {
    accumulators: BTreeMap<SectorKey, (f64, u64)>,
}

impl SectorAverages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, key: SectorKey, value: f64) {
        let entry = self.accumulators.entry(key).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    pub fn average(&self, key: SectorKey) -> Option<f64> {
        self.accumulators
            .get(&key)
            .map(|&(sum, count)| sum / count as f64)
    }

    pub fn count(&self, key: SectorKey) -> u64 {
        self.accumulators.get(&key).map(|&(_, n)| n).unwrap_or(0)
    }

    /// Sector keys that received at least one value, in key order.
    pub fn keys(&self) -> impl Iterator<Item = SectorKey> + '_ {
        self.accumulators.keys().copied()
    }
}
