use std::collections::BTreeMap;
use std::error::Error;

use krcore::algorithm::gain::{compute_gain, GainRecord};
use krcore::algorithm::peak::{fit_sector_reference, locate_pads};
use krcore::algorithm::sector::SectorAverages;
use krcore::config::KryptonConfig;
use krcore::data::histogram::{PadKey, SectorKey};

use crate::calib::accumulator::SpectrumAccumulator;
use crate::calib::audit::{AuditRow, SectorSummary};
use crate::data::geometry::TpcLayout;

/// Everything the analysis passes produce for the writers.
#[derive(Clone, Debug, Default)]
pub struct CalibrationResult {
    /// One record per pad with sufficient statistics and a converged fit.
    pub records: BTreeMap<PadKey, GainRecord>,
    /// One row per pad of the selected TPCs, excluded pads included.
    pub audit_rows: Vec<AuditRow>,
    pub sector_summaries: Vec<SectorSummary>,
}

/// Runs the analysis passes over filled spectra: per-pad peak location
/// feeding the sector reference averages, then gain computation in
/// geometry order.
///
/// Peak location fans out across pads; the sector aggregation that
/// follows is sequential and ordered, so results do not depend on
/// scheduling. A selected sector where every pad was excluded has no
/// defined reference; that is a mis-specified run rather than ordinary
/// statistical sparsity, and comes back as an error naming the sector.
pub fn analyze(
    accumulator: &SpectrumAccumulator,
    layout: &TpcLayout,
    config: &KryptonConfig,
    update_gains: bool,
) -> Result<CalibrationResult, Box<dyn Error>> {
    // Pass over all pads: locate peaks, then aggregate per sector.
    let located = locate_pads(accumulator.spectra(), config);

    let mut peaks: BTreeMap<PadKey, f64> = BTreeMap::new();
    let mut averages = SectorAverages::new();
    for (key, fit) in &located {
        peaks.insert(*key, fit.position);
        averages.add_value(key.sector_key(), fit.position);
    }

    // Final pass: normalize each pad against its sector reference,
    // walking the geometry in nesting order.
    let mut result = CalibrationResult::default();
    for chamber in &layout.chambers {
        if !config.is_selected(chamber.id) {
            continue;
        }
        for sector in &chamber.sectors {
            let sector_key = SectorKey { tpc: chamber.id, sector: sector.id };
            let average = averages.average(sector_key).ok_or_else(|| {
                format!(
                    "no pad in tpc {} sector {} produced a usable peak; \
                     the sector reference is undefined. Check the configured \
                     TPC list, cluster cuts, and minimum entry count.",
                    chamber.id, sector.id
                )
            })?;

            for padrow in &sector.padrows {
                for pad in 1..=padrow.n_pads {
                    let key = PadKey::new(chamber.id, sector.id, padrow.id, pad);
                    match peaks.get(&key) {
                        Some(&peak) => {
                            let prior = update_gains.then(|| layout.prior_gain(&key));
                            let record = compute_gain(
                                key,
                                average,
                                peak,
                                prior,
                                config.min_acceptable_gain,
                                config.max_acceptable_gain,
                            );
                            result.audit_rows.push(AuditRow::from(&record));
                            result.records.insert(key, record);
                        }
                        None => result.audit_rows.push(AuditRow {
                            tpc: key.tpc,
                            sector: key.sector,
                            padrow: key.padrow,
                            pad: key.pad,
                            peak_position: 0.0,
                            gain: 0.0,
                        }),
                    }
                }
            }

            let (qa_fit_mean, qa_fit_sigma) = accumulator
                .sector_spectra()
                .get(&sector_key)
                .and_then(|qa| {
                    fit_sector_reference(
                        &qa.all_cuts,
                        config.min_search_charge_for(chamber.id, sector.id),
                    )
                })
                .unwrap_or((0.0, 0.0));

            result.sector_summaries.push(SectorSummary {
                tpc: chamber.id,
                sector: sector.id,
                contributing_pads: averages.count(sector_key),
                average_peak: average,
                qa_fit_mean,
                qa_fit_sigma,
            });
        }
    }

    Ok(result)
}
