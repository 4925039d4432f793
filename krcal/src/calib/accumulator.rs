use std::collections::BTreeMap;

use krcore::config::KryptonConfig;
use krcore::data::event::{ClusterCuts, PadCluster};
use krcore::data::histogram::{ChargeSpectrum, PadKey, SectorKey};

use crate::data::geometry::TpcLayout;

/// Bins incoming cluster charges into per-pad spectra.
///
/// One `ChargeSpectrum` pair is created for every pad of the selected
/// TPCs before any event arrives, so the pad set is fixed for the whole
/// accumulation pass. Sector-level QA spectra (double bin count, same
/// range) are filled alongside. Events pointing at a pad the geometry
/// does not have are counted and dropped; they never abort the run.
pub struct SpectrumAccumulator {
    spectra: BTreeMap<PadKey, ChargeSpectrum>,
    sector_spectra: BTreeMap<SectorKey, ChargeSpectrum>,
    prior_gains: Option<BTreeMap<PadKey, f64>>,
    cuts: ClusterCuts,
    dropped: u64,
}

impl SpectrumAccumulator {
    /// Builds the pad and sector spectrum maps for the selected TPCs.
    /// With `update_gains` set, accepted charges are rescaled by the
    /// prior gain of their pad before entering the all-cuts spectrum.
    pub fn new(layout: &TpcLayout, config: &KryptonConfig, update_gains: bool) -> Self {
        let mut spectra = BTreeMap::new();
        let mut sector_spectra = BTreeMap::new();
        let mut prior_gains = update_gains.then(BTreeMap::new);

        for chamber in &layout.chambers {
            if !config.is_selected(chamber.id) {
                continue;
            }
            for sector in &chamber.sectors {
                let high = config.histogram_max_for(chamber.id, sector.id);
                sector_spectra.insert(
                    SectorKey { tpc: chamber.id, sector: sector.id },
                    ChargeSpectrum::new(2 * config.histogram_bins, 0.0, high),
                );
                for padrow in &sector.padrows {
                    for pad in 1..=padrow.n_pads {
                        let key = PadKey::new(chamber.id, sector.id, padrow.id, pad);
                        spectra.insert(key, ChargeSpectrum::new(config.histogram_bins, 0.0, high));
                        if let Some(priors) = prior_gains.as_mut() {
                            priors.insert(key, layout.prior_gain(&key));
                        }
                    }
                }
            }
        }

        SpectrumAccumulator {
            spectra,
            sector_spectra,
            prior_gains,
            cuts: config.cuts,
            dropped: 0,
        }
    }

    /// Accumulates one cluster attributed to (tpc, sector).
    ///
    /// The no-cuts spectra always receive the raw charge. The all-cuts
    /// spectra receive it only when the quality cuts pass, rescaled by
    /// the prior gain in update mode.
    pub fn accumulate(&mut self, tpc: u32, sector: u32, cluster: &PadCluster) {
        let key = PadKey::new(tpc, sector, cluster.padrow, cluster.pad);

        let spectrum = match self.spectra.get_mut(&key) {
            Some(s) => s,
            None => {
                self.dropped += 1;
                return;
            }
        };
        spectrum.no_cuts.fill(cluster.charge);
        if let Some(qa) = self.sector_spectra.get_mut(&key.sector_key()) {
            qa.no_cuts.fill(cluster.charge);
        }

        if !self.cuts.passes(cluster) {
            return;
        }

        let charge = match &self.prior_gains {
            Some(priors) => cluster.charge * priors.get(&key).copied().unwrap_or(1.0),
            None => cluster.charge,
        };

        spectrum.all_cuts.fill(charge);
        if let Some(qa) = self.sector_spectra.get_mut(&key.sector_key()) {
            qa.all_cuts.fill(charge);
        }
    }

    pub fn spectra(&self) -> &BTreeMap<PadKey, ChargeSpectrum> {
        &self.spectra
    }

    pub fn sector_spectra(&self) -> &BTreeMap<SectorKey, ChargeSpectrum> {
        &self.sector_spectra
    }

    /// Number of events that referenced a pad the geometry does not have.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Total fills across all pad no-cuts spectra.
    pub fn total_entries(&self) -> u64 {
        self.spectra.values().map(|s| s.no_cuts.entries()).sum()
    }
}
