use std::collections::BTreeMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use krcore::data::histogram::PadKey;

/// One padrow: its id, how many pads it carries, and (optionally) the
/// per-pad gains of a previous calibration. `pad_gains[i]` belongs to
/// pad `i + 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Padrow {
    pub id: u32,
    pub n_pads: u32,
    #[serde(default)]
    pub pad_gains: Option<Vec<f64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sector {
    pub id: u32,
    pub padrows: Vec<Padrow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chamber {
    pub id: u32,
    pub name: String,
    pub sectors: Vec<Sector>,
}

/// The detector geometry: chambers → sectors → padrows → pad counts.
///
/// Loaded once per run from a JSON layout file. The element order of
/// the file is the enumeration order, and enumeration order defines the
/// output order of the gain table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TpcLayout {
    pub chambers: Vec<Chamber>,
}

impl TpcLayout {
    /// Loads the layout. An unreadable or malformed layout is fatal for
    /// the run; there is nothing sensible to calibrate without it.
    pub fn from_file(path: &Path) -> Result<TpcLayout, Box<dyn Error>> {
        let file = File::open(path)
            .map_err(|e| format!("cannot open geometry layout {}: {}", path.display(), e))?;
        let layout: TpcLayout = serde_json::from_reader(BufReader::new(file))?;
        Ok(layout)
    }

    pub fn chamber(&self, tpc: u32) -> Option<&Chamber> {
        self.chambers.iter().find(|c| c.id == tpc)
    }

    pub fn chamber_id_by_name(&self, name: &str) -> Option<u32> {
        self.chambers.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn padrow(&self, tpc: u32, sector: u32, padrow: u32) -> Option<&Padrow> {
        self.chamber(tpc)?
            .sectors
            .iter()
            .find(|s| s.id == sector)?
            .padrows
            .iter()
            .find(|p| p.id == padrow)
    }

    /// Whether a pad key refers to a pad this geometry actually has.
    pub fn has_pad(&self, key: &PadKey) -> bool {
        match self.padrow(key.tpc, key.sector, key.padrow) {
            Some(padrow) => key.pad >= 1 && key.pad <= padrow.n_pads,
            None => false,
        }
    }

    /// The prior gain of a pad for update mode. Missing priors and
    /// sentinel/degenerate values (non-finite or ≤ 0, e.g. a −1 read
    /// back from an earlier table) degrade to 1.0.
    pub fn prior_gain(&self, key: &PadKey) -> f64 {
        let stored = self
            .padrow(key.tpc, key.sector, key.padrow)
            .and_then(|p| p.pad_gains.as_ref())
            .and_then(|g| g.get((key.pad - 1) as usize))
            .copied();
        match stored {
            Some(g) if g.is_finite() && g > 0.0 => g,
            _ => 1.0,
        }
    }

    /// Attaches prior gains parsed from a previously written gain
    /// table, overwriting whatever the layout file carried.
    pub fn attach_prior_gains(&mut self, gains: &BTreeMap<PadKey, f64>) {
        for chamber in &mut self.chambers {
            for sector in &mut chamber.sectors {
                for padrow in &mut sector.padrows {
                    let mut row = vec![1.0; padrow.n_pads as usize];
                    for pad in 1..=padrow.n_pads {
                        let key = PadKey::new(chamber.id, sector.id, padrow.id, pad);
                        if let Some(&g) = gains.get(&key) {
                            row[(pad - 1) as usize] = g;
                        }
                    }
                    padrow.pad_gains = Some(row);
                }
            }
        }
    }

    /// Every pad of the geometry in nesting order
    /// (tpc → sector → padrow → ascending pad id).
    pub fn pads(&self) -> impl Iterator<Item = PadKey> + '_ {
        self.chambers.iter().flat_map(|chamber| {
            chamber.sectors.iter().flat_map(move |sector| {
                sector.padrows.iter().flat_map(move |padrow| {
                    (1..=padrow.n_pads)
                        .map(move |pad| PadKey::new(chamber.id, sector.id, padrow.id, pad))
                })
            })
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn two_chamber_layout() -> TpcLayout {
        serde_json::from_str(
            r#"{
                "chambers": [
                    {
                        "id": 1,
                        "name": "VTPC1",
                        "sectors": [
                            { "id": 1, "padrows": [ { "id": 1, "n_pads": 3 }, { "id": 2, "n_pads": 2 } ] },
                            { "id": 2, "padrows": [ { "id": 1, "n_pads": 2 } ] }
                        ]
                    },
                    {
                        "id": 2,
                        "name": "MTPCL",
                        "sectors": [
                            { "id": 1, "padrows": [ { "id": 1, "n_pads": 2 } ] }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_enumeration_follows_nesting_order() {
        let layout = two_chamber_layout();
        let pads: Vec<PadKey> = layout.pads().collect();
        assert_eq!(pads.len(), 9);
        assert_eq!(pads[0], PadKey::new(1, 1, 1, 1));
        assert_eq!(pads[2], PadKey::new(1, 1, 1, 3));
        assert_eq!(pads[3], PadKey::new(1, 1, 2, 1));
        assert_eq!(pads[5], PadKey::new(1, 2, 1, 1));
        assert_eq!(pads[8], PadKey::new(2, 1, 1, 2));
    }

    #[test]
    fn test_has_pad_respects_pad_count() {
        let layout = two_chamber_layout();
        assert!(layout.has_pad(&PadKey::new(1, 1, 1, 3)));
        assert!(!layout.has_pad(&PadKey::new(1, 1, 1, 4)));
        assert!(!layout.has_pad(&PadKey::new(1, 1, 1, 0)));
        assert!(!layout.has_pad(&PadKey::new(3, 1, 1, 1)));
    }

    #[test]
    fn test_prior_gain_defaults_and_sentinels() {
        let mut layout = two_chamber_layout();
        // Nothing attached: every prior is 1.0.
        assert_eq!(layout.prior_gain(&PadKey::new(1, 1, 1, 1)), 1.0);

        let mut gains = BTreeMap::new();
        gains.insert(PadKey::new(1, 1, 1, 1), 1.2);
        gains.insert(PadKey::new(1, 1, 1, 2), -1.0);
        layout.attach_prior_gains(&gains);

        assert_eq!(layout.prior_gain(&PadKey::new(1, 1, 1, 1)), 1.2);
        // The sentinel degrades to 1.0 instead of poisoning the rescale.
        assert_eq!(layout.prior_gain(&PadKey::new(1, 1, 1, 2)), 1.0);
        assert_eq!(layout.prior_gain(&PadKey::new(1, 1, 1, 3)), 1.0);
    }

    #[test]
    fn test_chamber_lookup_by_name() {
        let layout = two_chamber_layout();
        assert_eq!(layout.chamber_id_by_name("VTPC1"), Some(1));
        assert_eq!(layout.chamber_id_by_name("MTPCL"), Some(2));
        assert_eq!(layout.chamber_id_by_name("GTPC"), None);
    }
}
