use std::collections::BTreeMap;

use itertools::izip;
use nalgebra::{Matrix3, Vector3};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::KryptonConfig;
use crate::data::histogram::{ChargeSpectrum, Histogram1D, PadKey};

/// Peak localization strategy. `Peak` fits a Gaussian to the resolved
/// calibration peak; `Edge` fits a Fermi/sigmoid curve to the upper
/// falloff and is meant for spectra where the peak itself is washed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Peak,
    Edge,
}

/// Result of a successful peak localization.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeakFit {
    /// Fitted peak mean (peak mode) or edge inflection (edge mode).
    pub position: f64,
    /// Gaussian sigma, or the inverse edge slope.
    pub width: f64,
    /// Fitted amplitude; in edge mode this is the fixed provisional
    /// peak content.
    pub height: f64,
    /// Charge range the fit was restricted to.
    pub window: (f64, f64),
}

/// Locates the calibration peak in one pad spectrum.
///
/// Returns `None` when the spectrum has fewer than `min_entries` total
/// fills, when no bin at or above `min_search_charge` has content, or
/// when the restricted fit does not converge. All three cases mean the
/// pad is excluded from the calibration, not that an error occurred.
pub fn locate_peak(
    hist: &Histogram1D,
    min_search_charge: f64,
    mode: FitMode,
    min_entries: u64,
) -> Option<PeakFit> {
    if hist.entries() < min_entries {
        return None;
    }

    let n_bins = hist.n_bins();
    if n_bins < 3 {
        return None;
    }

    // Provisional peak: maximum-content bin with center at or above the
    // search threshold. The final bin stays out of the scan; the first
    // maximum wins.
    let mut max_bin = 0usize;
    let mut peak_charge = 0.0;
    let mut peak_value = 0.0;
    for bin in 0..n_bins - 1 {
        let center = hist.bin_center(bin);
        if center < min_search_charge {
            continue;
        }
        let value = hist.content(bin);
        if value > peak_value {
            max_bin = bin;
            peak_charge = center;
            peak_value = value;
        }
    }

    if peak_value <= 0.0 {
        return None;
    }

    match mode {
        FitMode::Peak => fit_symmetric_peak(hist, max_bin, peak_value),
        FitMode::Edge => fit_upper_edge(hist, max_bin, peak_charge, peak_value),
    }
}

/// Peak mode: walk out to the half-maximum crossings on both sides of
/// the provisional peak (independent walks), then fit a Gaussian
/// restricted to that window.
fn fit_symmetric_peak(hist: &Histogram1D, max_bin: usize, peak_value: f64) -> Option<PeakFit> {
    let n_bins = hist.n_bins();
    let half = 0.5 * peak_value;

    // Left walk stops before bin 0; a missing crossing leaves the lower
    // bound at zero charge.
    let mut fit_min = 0.0;
    for bin in (1..=max_bin).rev() {
        if hist.content(bin) < half {
            fit_min = hist.bin_center(bin);
            break;
        }
    }

    // Right walk may reach the final bin. A missing crossing leaves the
    // window degenerate and the fit reports no convergence.
    let mut fit_max = 0.0;
    for bin in max_bin..n_bins {
        if hist.content(bin) < half {
            fit_max = hist.bin_center(bin);
            break;
        }
    }

    if fit_max <= fit_min {
        return None;
    }

    let (xs, ys) = collect_fit_points(hist, fit_min, fit_max);
    let (mean, sigma, height) = fit_gaussian(&xs, &ys)?;

    // Convergence sanity: the mean has to land inside the histogram.
    if !mean.is_finite() || mean < hist.low() || mean > hist.high() {
        return None;
    }

    Some(PeakFit {
        position: mean,
        width: sigma,
        height,
        window: (fit_min, fit_max),
    })
}

/// Edge mode: fit `amplitude / (1 + exp(slope·(x − edge)))` from the
/// provisional peak to the end of the spectrum, amplitude fixed to the
/// provisional peak content and slope constrained to [1e-4, 1]. The
/// fitted inflection is the located position.
fn fit_upper_edge(
    hist: &Histogram1D,
    max_bin: usize,
    peak_charge: f64,
    peak_value: f64,
) -> Option<PeakFit> {
    let max_charge = hist.bin_center(hist.n_bins() - 1);
    let (xs, ys) = collect_fit_points(hist, peak_charge, max_charge);
    if xs.len() < 3 {
        return None;
    }

    let (edge, slope) = fit_fermi(&xs, &ys, peak_value, peak_charge, max_charge)?;

    Some(PeakFit {
        position: edge,
        width: 1.0 / slope,
        height: peak_value,
        window: (peak_charge, max_charge),
    })
}

/// Gather the non-empty bins whose centers fall inside `[lo, hi]`.
fn collect_fit_points(hist: &Histogram1D, lo: f64, hi: f64) -> (Vec<f64>, Vec<f64>) {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for bin in 0..hist.n_bins() {
        let center = hist.bin_center(bin);
        if center < lo || center > hi {
            continue;
        }
        let content = hist.content(bin);
        if content > 0.0 {
            xs.push(center);
            ys.push(content);
        }
    }
    (xs, ys)
}

/// Gaussian fit via a content-weighted parabola on log counts
/// (Caruana's method). Returns (mean, sigma, height), or `None` when
/// the points cannot support a concave parabola.
fn fit_gaussian(xs: &[f64], ys: &[f64]) -> Option<(f64, f64, f64)> {
    if xs.len() < 3 {
        return None;
    }

    let mut s = [0.0f64; 5];
    let mut t = [0.0f64; 3];
    for (&x, &y) in izip!(xs, ys) {
        let w = y;
        let ln_y = y.ln();
        let mut xp = 1.0;
        for k in 0..5 {
            s[k] += w * xp;
            if k < 3 {
                t[k] += w * xp * ln_y;
            }
            xp *= x;
        }
    }

    let m = Matrix3::new(s[0], s[1], s[2], s[1], s[2], s[3], s[2], s[3], s[4]);
    let v = Vector3::new(t[0], t[1], t[2]);
    let coeffs = m.lu().solve(&v)?;
    let (a, b, c) = (coeffs[0], coeffs[1], coeffs[2]);

    if !(c < 0.0) {
        return None;
    }

    let mean = -b / (2.0 * c);
    let sigma = (-1.0 / (2.0 * c)).sqrt();
    let height = (a - b * b / (4.0 * c)).exp();
    if !mean.is_finite() || !sigma.is_finite() {
        return None;
    }

    Some((mean, sigma, height))
}

const FERMI_SLOPE_MIN: f64 = 1e-4;
const FERMI_SLOPE_MAX: f64 = 1.0;

fn fermi(x: f64, amplitude: f64, slope: f64, edge: f64) -> f64 {
    amplitude / (1.0 + (slope * (x - edge)).exp())
}

fn fermi_sse(xs: &[f64], ys: &[f64], amplitude: f64, slope: f64, edge: f64) -> f64 {
    izip!(xs, ys)
        .map(|(&x, &y)| {
            let r = fermi(x, amplitude, slope, edge) - y;
            r * r
        })
        .sum()
}

/// Least-squares Fermi fit with fixed amplitude: a coarse grid over the
/// constrained (slope, edge) plane followed by three zoom refinements.
/// Deterministic, and convergent by construction on any non-empty input.
fn fit_fermi(
    xs: &[f64],
    ys: &[f64],
    amplitude: f64,
    edge_lo: f64,
    edge_hi: f64,
) -> Option<(f64, f64)> {
    if edge_hi <= edge_lo {
        return None;
    }

    let coarse_slopes: Vec<f64> = (0..25)
        .map(|i| {
            FERMI_SLOPE_MIN * (FERMI_SLOPE_MAX / FERMI_SLOPE_MIN).powf(i as f64 / 24.0)
        })
        .collect();
    let coarse_edges: Vec<f64> = (0..40)
        .map(|i| edge_lo + (edge_hi - edge_lo) * i as f64 / 39.0)
        .collect();

    let mut best = coarse_slopes
        .iter()
        .flat_map(|&s| coarse_edges.iter().map(move |&e| (s, e)))
        .min_by_key(|&(s, e)| OrderedFloat(fermi_sse(xs, ys, amplitude, s, e)))?;

    let mut slope_span = (FERMI_SLOPE_MAX / FERMI_SLOPE_MIN).powf(1.0 / 24.0);
    let mut edge_span = (edge_hi - edge_lo) / 39.0;
    for _ in 0..3 {
        let (s0, e0) = best;
        let candidates: Vec<(f64, f64)> = (-4..=4)
            .flat_map(|i| {
                let s = (s0 * slope_span.powf(i as f64 / 4.0))
                    .clamp(FERMI_SLOPE_MIN, FERMI_SLOPE_MAX);
                (-4..=4).map(move |j| {
                    let e = (e0 + edge_span * j as f64 / 4.0).clamp(edge_lo, edge_hi);
                    (s, e)
                })
            })
            .collect();
        best = candidates
            .into_iter()
            .min_by_key(|&(s, e)| OrderedFloat(fermi_sse(xs, ys, amplitude, s, e)))?;
        slope_span = slope_span.powf(0.5);
        edge_span *= 0.5;
    }

    let (slope, edge) = best;
    if !edge.is_finite() {
        return None;
    }
    Some((edge, slope))
}

/// Runs peak localization over every pad spectrum, fanning out across
/// pads. Excluded pads are simply absent from the result; ordering
/// follows the key order of the input map so downstream aggregation is
/// deterministic.
pub fn locate_pads(
    spectra: &BTreeMap<PadKey, ChargeSpectrum>,
    config: &KryptonConfig,
) -> Vec<(PadKey, PeakFit)> {
    let pads: Vec<(&PadKey, &ChargeSpectrum)> = spectra.iter().collect();
    pads.par_iter()
        .filter_map(|(key, spectrum)| {
            let min_search = config.min_search_charge_for(key.tpc, key.sector);
            locate_peak(
                &spectrum.all_cuts,
                min_search,
                config.fit_mode,
                config.min_histogram_entries,
            )
            .map(|fit| (**key, fit))
        })
        .collect()
}

/// QA fit of a sector-level spectrum around its peak.
///
/// Unlike the per-pad half-maximum walks, this variant steps an absolute
/// number of bins (at most 50) away from the maximum until the content
/// drops below 0.7 of the peak, and uses that step count symmetrically
/// as the fit half-width. The two boundary searches are intentionally
/// kept separate. Returns the fitted (mean, sigma).
pub fn fit_sector_reference(hist: &Histogram1D, min_search_charge: f64) -> Option<(f64, f64)> {
    let n_bins = hist.n_bins();
    if n_bins == 0 {
        return None;
    }

    let start = (((min_search_charge - hist.low()) / hist.bin_width()) as usize).min(n_bins - 1);
    let mut max_bin = start;
    let mut max_value = hist.content(start);
    for bin in start..n_bins {
        if hist.content(bin) > max_value {
            max_bin = bin;
            max_value = hist.content(bin);
        }
    }
    if max_value <= 0.0 {
        return None;
    }

    let mut half_width = max_bin;
    for i in 0..50 {
        if hist.content(max_bin + i) < 0.7 * max_value {
            half_width = i;
            break;
        }
    }

    let fit_min = hist.bin_center(max_bin.saturating_sub(half_width));
    let fit_max = hist.bin_center((max_bin + half_width).min(n_bins - 1));
    let (xs, ys) = collect_fit_points(hist, fit_min, fit_max);
    let (mean, sigma, _height) = fit_gaussian(&xs, &ys)?;
    if !mean.is_finite() {
        return None;
    }
    Some((mean, sigma))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fill `hist` with round(shape(center)) entries per bin.
    fn fill_shape<F: Fn(f64) -> f64>(hist: &mut Histogram1D, shape: F) {
        for bin in 0..hist.n_bins() {
            let center = hist.bin_center(bin);
            let n = shape(center).round() as usize;
            for _ in 0..n {
                hist.fill(center);
            }
        }
    }

    fn gaussian_hist(mean: f64, sigma: f64, height: f64) -> Histogram1D {
        let mut hist = Histogram1D::new(100, 0.0, 3200.0);
        fill_shape(&mut hist, |x| {
            height * (-(x - mean) * (x - mean) / (2.0 * sigma * sigma)).exp()
        });
        hist
    }

    #[test]
    fn test_too_few_entries_is_excluded() {
        let mut hist = Histogram1D::new(100, 0.0, 3200.0);
        for _ in 0..5 {
            hist.fill(1600.0);
        }
        assert!(locate_peak(&hist, 800.0, FitMode::Peak, 10).is_none());
    }

    #[test]
    fn test_empty_search_range_is_excluded() {
        let mut hist = Histogram1D::new(100, 0.0, 3200.0);
        // Plenty of entries, all below the search threshold.
        for _ in 0..1000 {
            hist.fill(100.0);
        }
        assert!(locate_peak(&hist, 800.0, FitMode::Peak, 10).is_none());
    }

    #[test]
    fn test_gaussian_peak_recovered() {
        let hist = gaussian_hist(1600.0, 150.0, 400.0);
        let fit = locate_peak(&hist, 800.0, FitMode::Peak, 10).unwrap();
        assert!(
            (fit.position - 1600.0).abs() < hist.bin_width(),
            "fitted mean {} too far from 1600",
            fit.position
        );
        assert!(fit.width > 0.0);
    }

    #[test]
    fn test_search_threshold_skips_low_peak() {
        // A taller noise peak below the threshold must not win the scan.
        let mut hist = Histogram1D::new(100, 0.0, 3200.0);
        fill_shape(&mut hist, |x| {
            let noise = 900.0 * (-(x - 300.0) * (x - 300.0) / (2.0 * 80.0 * 80.0)).exp();
            let peak = 300.0 * (-(x - 1800.0) * (x - 1800.0) / (2.0 * 120.0 * 120.0)).exp();
            noise + peak
        });
        let fit = locate_peak(&hist, 800.0, FitMode::Peak, 10).unwrap();
        assert!((fit.position - 1800.0).abs() < 2.0 * hist.bin_width());
    }

    #[test]
    fn test_edge_mode_recovers_inflection() {
        let mut hist = Histogram1D::new(100, 0.0, 3200.0);
        // Flat plateau falling off at 2000 with slope 0.02.
        fill_shape(&mut hist, |x| 500.0 / (1.0 + (0.02 * (x - 2000.0)).exp()));
        let fit = locate_peak(&hist, 800.0, FitMode::Edge, 10).unwrap();
        assert!(
            (fit.position - 2000.0).abs() < 3.0 * hist.bin_width(),
            "fitted edge {} too far from 2000",
            fit.position
        );
    }

    #[test]
    fn test_sector_reference_fit() {
        let hist = gaussian_hist(1500.0, 200.0, 800.0);
        let (mean, sigma) = fit_sector_reference(&hist, 800.0).unwrap();
        assert!((mean - 1500.0).abs() < 2.0 * hist.bin_width());
        assert!(sigma > 0.0);
    }

    #[test]
    fn test_locate_pads_skips_thin_spectra() {
        let config = KryptonConfig {
            tpc_ids: vec![1],
            min_histogram_entries: 50,
            ..Default::default()
        };

        let mut spectra = BTreeMap::new();
        let mut rich = ChargeSpectrum::new(100, 0.0, 3200.0);
        rich.all_cuts = gaussian_hist(1600.0, 150.0, 400.0);
        spectra.insert(PadKey::new(1, 1, 1, 1), rich);

        let mut thin = ChargeSpectrum::new(100, 0.0, 3200.0);
        for _ in 0..5 {
            thin.all_cuts.fill(1600.0);
        }
        spectra.insert(PadKey::new(1, 1, 1, 2), thin);

        let located = locate_pads(&spectra, &config);
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].0, PadKey::new(1, 1, 1, 1));
    }
}
