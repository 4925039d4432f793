extern crate rand;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use statrs::distribution::Normal;

use crate::data::event::PadCluster;

/// Generates `n` calibration-like clusters for one pad: charges normally
/// distributed around `peak_charge`, cluster shapes sized to survive the
/// default quality cuts. Lowering `peak_charge` for a pad emulates a
/// low-gain channel.
///
/// The caller supplies the RNG, so seeded runs are reproducible.
pub fn krypton_clusters<R: Rng>(
    rng: &mut R,
    padrow: u32,
    pad: u32,
    n: usize,
    peak_charge: f64,
    peak_sigma: f64,
) -> Vec<PadCluster> {
    let charge_dist = Normal::new(peak_charge, peak_sigma.max(1e-6)).unwrap();
    let pads_dist = Uniform::from(2..=6u32);
    let slices_dist = Uniform::from(3..=10u32);
    let time_dist = Uniform::from(40..=200u32);

    (0..n)
        .map(|_| {
            let charge: f64 = charge_dist.sample(rng).max(1.0);
            PadCluster {
                charge,
                max_adc: (charge / 8.0).min(255.0) as u32,
                time_slice: time_dist.sample(rng),
                n_pads: pads_dist.sample(rng),
                n_time_slices: slices_dist.sample(rng),
                padrow,
                pad,
            }
        })
        .collect()
}

/// Generates clusters that fail the quality cuts (single-pad, early in
/// drift time, low charge). Useful for exercising the no-cuts/all-cuts
/// split.
pub fn background_clusters<R: Rng>(rng: &mut R, padrow: u32, pad: u32, n: usize) -> Vec<PadCluster> {
    let charge_dist = Uniform::from(1.0..120.0f64);

    (0..n)
        .map(|_| PadCluster {
            charge: charge_dist.sample(rng),
            max_adc: 12,
            time_slice: 3,
            n_pads: 1,
            n_time_slices: 1,
            padrow,
            pad,
        })
        .collect()
}
