use serde::{Deserialize, Serialize};

use crate::algorithm::peak::FitMode;
use crate::data::event::ClusterCuts;

/// A lowered minimum search charge for specific sector positions whose
/// spectra sit lower than the rest of the chamber (e.g. sectors directly
/// behind the beam window).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SearchChargeOverride {
    pub tpc: u32,
    pub sector: u32,
    pub min_search_charge: f64,
}

/// The full configuration surface of a calibration run. Constructed once
/// (from file or `Default`) and passed by reference everywhere; nothing
/// mutates it after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KryptonConfig {
    /// TPC chamber ids to calibrate. Events and pads of other chambers
    /// are ignored.
    pub tpc_ids: Vec<u32>,
    pub fit_mode: FitMode,
    pub min_acceptable_gain: f64,
    pub max_acceptable_gain: f64,
    /// Pads with fewer total fills than this are excluded from fitting.
    pub min_histogram_entries: u64,
    pub histogram_bins: usize,
    /// Histogram upper edge = min search charge × this factor.
    pub histogram_padding: f64,
    pub cuts: ClusterCuts,
    /// Lower bound of the peak search, in charge units.
    pub min_search_charge: f64,
    pub search_charge_overrides: Vec<SearchChargeOverride>,
}

impl Default for KryptonConfig {
    fn default() -> Self {
        Self {
            tpc_ids: Vec::new(),
            fit_mode: FitMode::Peak,
            min_acceptable_gain: 0.5,
            max_acceptable_gain: 2.0,
            min_histogram_entries: 100,
            histogram_bins: 100,
            histogram_padding: 4.0,
            cuts: ClusterCuts::default(),
            min_search_charge: 800.0,
            search_charge_overrides: Vec::new(),
        }
    }
}

impl KryptonConfig {
    pub fn is_selected(&self, tpc: u32) -> bool {
        self.tpc_ids.contains(&tpc)
    }

    /// The minimum search charge for a sector, honoring overrides.
    pub fn min_search_charge_for(&self, tpc: u32, sector: u32) -> f64 {
        self.search_charge_overrides
            .iter()
            .find(|o| o.tpc == tpc && o.sector == sector)
            .map(|o| o.min_search_charge)
            .unwrap_or(self.min_search_charge)
    }

    /// Upper histogram edge for a sector's pads.
    pub fn histogram_max_for(&self, tpc: u32, sector: u32) -> f64 {
        self.min_search_charge_for(tpc, sector) * self.histogram_padding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_applies_to_named_sector_only() {
        let config = KryptonConfig {
            search_charge_overrides: vec![SearchChargeOverride {
                tpc: 1,
                sector: 4,
                min_search_charge: 400.0,
            }],
            ..Default::default()
        };

        assert_eq!(config.min_search_charge_for(1, 4), 400.0);
        assert_eq!(config.min_search_charge_for(1, 5), 800.0);
        assert_eq!(config.min_search_charge_for(2, 4), 800.0);
    }

    #[test]
    fn test_histogram_max_follows_override() {
        let config = KryptonConfig {
            search_charge_overrides: vec![SearchChargeOverride {
                tpc: 1,
                sector: 1,
                min_search_charge: 400.0,
            }],
            ..Default::default()
        };

        assert_eq!(config.histogram_max_for(1, 1), 1600.0);
        assert_eq!(config.histogram_max_for(1, 2), 3200.0);
    }
}
