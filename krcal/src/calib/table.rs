use std::collections::BTreeMap;
use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use itertools::Itertools;
use regex::Regex;

use krcore::algorithm::gain::{GainRecord, GAIN_SENTINEL};
use krcore::data::histogram::PadKey;

use crate::data::geometry::TpcLayout;

/// Writes the pad-by-pad gain table.
///
/// The walk is the geometry enumeration order (tpc → sector → padrow →
/// ascending pad id) regardless of how the records were produced, and
/// the emitted nesting is the external contract: one `<PadGains>` line
/// per padrow, one space-separated value per pad, sentinel −1 for pads
/// without an acceptable gain. Downstream loaders consume this format
/// positionally, so nothing here may reorder or omit fields.
pub fn write_gain_table<W: Write>(
    out: &mut W,
    layout: &TpcLayout,
    records: &BTreeMap<PadKey, GainRecord>,
) -> std::io::Result<()> {
    write!(
        out,
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         \n\
         <PadByPadGain\n\
         \x20 xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"\n\
         \x20 xsi:noNamespaceSchemaLocation=\"[SCHEMAPATH]/TPCPadGain_DataFormat.xsd\">\n\
         \n"
    )?;

    for chamber in &layout.chambers {
        writeln!(out, "  <TPC name=\"{}\">", chamber.name)?;
        for sector in &chamber.sectors {
            writeln!(out, "    <Sector id=\"{}\">", sector.id)?;
            for padrow in &sector.padrows {
                writeln!(out, "      <Padrow id=\"{}\">", padrow.id)?;
                let gains = (1..=padrow.n_pads)
                    .map(|pad| {
                        let key = PadKey::new(chamber.id, sector.id, padrow.id, pad);
                        let value = records
                            .get(&key)
                            .map(|r| r.table_value())
                            .unwrap_or(GAIN_SENTINEL);
                        format!("{}", value)
                    })
                    .join(" ");
                writeln!(out, "        <PadGains> {} </PadGains>", gains)?;
                writeln!(out, "      </Padrow>")?;
            }
            writeln!(out, "    </Sector>")?;
        }
        writeln!(out, "  </TPC>")?;
    }
    writeln!(out, "</PadByPadGain>")?;
    Ok(())
}

/// Reads a previously written gain table back into a per-pad map, for
/// update mode. Chambers whose name the layout does not know are
/// skipped; sentinel values are kept as stored (the geometry layer
/// degrades them when they are looked up as priors).
pub fn read_gain_table(
    path: &Path,
    layout: &TpcLayout,
) -> Result<BTreeMap<PadKey, f64>, Box<dyn Error>> {
    let file = File::open(path)
        .map_err(|e| format!("cannot open gain table {}: {}", path.display(), e))?;
    parse_gain_table(BufReader::new(file), layout)
}

pub fn parse_gain_table<R: BufRead>(
    reader: R,
    layout: &TpcLayout,
) -> Result<BTreeMap<PadKey, f64>, Box<dyn Error>> {
    let tpc_pattern = Regex::new(r#"<TPC name="([^"]+)">"#).unwrap();
    let sector_pattern = Regex::new(r#"<Sector id="([0-9]+)">"#).unwrap();
    let padrow_pattern = Regex::new(r#"<Padrow id="([0-9]+)">"#).unwrap();
    let gains_pattern = Regex::new(r"<PadGains>(.*)</PadGains>").unwrap();

    let mut gains = BTreeMap::new();
    let mut tpc: Option<u32> = None;
    let mut sector: Option<u32> = None;
    let mut padrow: Option<u32> = None;

    for line in reader.lines() {
        let line = line?;
        if let Some(captures) = tpc_pattern.captures(&line) {
            tpc = layout.chamber_id_by_name(&captures[1]);
        } else if let Some(captures) = sector_pattern.captures(&line) {
            sector = Some(captures[1].parse()?);
        } else if let Some(captures) = padrow_pattern.captures(&line) {
            padrow = Some(captures[1].parse()?);
        } else if let Some(captures) = gains_pattern.captures(&line) {
            let (tpc, sector, padrow) = match (tpc, sector, padrow) {
                (Some(t), Some(s), Some(p)) => (t, s, p),
                _ => continue,
            };
            for (index, field) in captures[1].split_whitespace().enumerate() {
                let value: f64 = field.parse()?;
                gains.insert(PadKey::new(tpc, sector, padrow, index as u32 + 1), value);
            }
        }
    }

    Ok(gains)
}
