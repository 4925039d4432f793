use std::error::Error;
use std::path::Path;

use regex::Regex;
use rusqlite::{Connection, OpenFlags};

use krcore::data::event::PadCluster;

use crate::data::geometry::TpcLayout;

/// All clusters of one (tpc, sector) recovered from a single input file.
#[derive(Clone, Debug)]
pub struct SectorClusters {
    pub tpc: u32,
    pub sector: u32,
    pub clusters: Vec<PadCluster>,
}

/// The content of one input file: per-sector cluster batches plus the
/// names of tables that were skipped because they do not look like
/// cluster tables or name an unknown chamber.
#[derive(Clone, Debug, Default)]
pub struct ClusterBatch {
    pub sectors: Vec<SectorClusters>,
    pub skipped_tables: Vec<String>,
}

/// Reads every per-sector cluster table from one SQLite file.
///
/// Tables are named `<TpcName>Sector<Id>Clusters`; anything else in the
/// file is reported in `skipped_tables` and otherwise ignored. A file
/// with foreign tables is not an error.
pub fn read_cluster_file(path: &Path, layout: &TpcLayout) -> Result<ClusterBatch, Box<dyn Error>> {
    // Read-only; a missing or unreadable input must surface as an error.
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    read_cluster_tables(&conn, layout)
}

/// Reads the cluster tables reachable through an open connection.
pub fn read_cluster_tables(
    conn: &Connection,
    layout: &TpcLayout,
) -> Result<ClusterBatch, Box<dyn Error>> {
    let table_pattern = Regex::new(r"^([A-Za-z][A-Za-z0-9]*?)Sector([0-9]+)Clusters$").unwrap();

    let names: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut batch = ClusterBatch::default();
    for name in names {
        let captures = match table_pattern.captures(&name) {
            Some(c) => c,
            None => {
                batch.skipped_tables.push(name);
                continue;
            }
        };

        let tpc_name = &captures[1];
        let sector: u32 = captures[2].parse()?;
        let tpc = match layout.chamber_id_by_name(tpc_name) {
            Some(id) => id,
            None => {
                batch.skipped_tables.push(name);
                continue;
            }
        };

        let clusters = read_clusters(conn, &name)?;
        if clusters.is_empty() {
            continue;
        }
        batch.sectors.push(SectorClusters { tpc, sector, clusters });
    }

    Ok(batch)
}

fn read_clusters(conn: &Connection, table: &str) -> Result<Vec<PadCluster>, Box<dyn Error>> {
    // The table name came out of sqlite_master and matched the cluster
    // table pattern, so it is safe to interpolate.
    let columns: Vec<&str> = vec![
        "charge",
        "max_adc",
        "time_slice",
        "n_pads",
        "n_time_slices",
        "padrow",
        "pad",
    ];
    let query = format!("SELECT {} FROM {}", columns.join(", "), table);

    let rows: Result<Vec<PadCluster>, _> = conn
        .prepare(&query)?
        .query_map([], |row| {
            Ok(PadCluster {
                charge: row.get(0)?,
                max_adc: row.get(1)?,
                time_slice: row.get(2)?,
                n_pads: row.get(3)?,
                n_time_slices: row.get(4)?,
                padrow: row.get(5)?,
                pad: row.get(6)?,
            })
        })?
        .collect();

    Ok(rows?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::geometry::tests::two_chamber_layout;

    fn create_cluster_table(conn: &Connection, table: &str) {
        conn.execute_batch(&format!(
            "CREATE TABLE {} (
                charge REAL,
                max_adc INTEGER,
                time_slice INTEGER,
                n_pads INTEGER,
                n_time_slices INTEGER,
                padrow INTEGER,
                pad INTEGER
            )",
            table
        ))
        .unwrap();
    }

    fn insert_cluster(conn: &Connection, table: &str, charge: f64, padrow: u32, pad: u32) {
        conn.execute(
            &format!(
                "INSERT INTO {} VALUES (?1, 100, 80, 3, 5, ?2, ?3)",
                table
            ),
            rusqlite::params![charge, padrow, pad],
        )
        .unwrap();
    }

    #[test]
    fn test_reads_matching_tables() {
        let conn = Connection::open_in_memory().unwrap();
        let layout = two_chamber_layout();

        create_cluster_table(&conn, "VTPC1Sector1Clusters");
        insert_cluster(&conn, "VTPC1Sector1Clusters", 1500.0, 1, 2);
        insert_cluster(&conn, "VTPC1Sector1Clusters", 1550.0, 1, 3);
        create_cluster_table(&conn, "MTPCLSector1Clusters");
        insert_cluster(&conn, "MTPCLSector1Clusters", 900.0, 1, 1);

        let batch = read_cluster_tables(&conn, &layout).unwrap();
        assert_eq!(batch.sectors.len(), 2);
        assert!(batch.skipped_tables.is_empty());

        // sqlite_master order is alphabetical.
        assert_eq!(batch.sectors[0].tpc, 2);
        assert_eq!(batch.sectors[1].tpc, 1);
        assert_eq!(batch.sectors[1].sector, 1);
        assert_eq!(batch.sectors[1].clusters.len(), 2);
        assert_eq!(batch.sectors[1].clusters[0].pad, 2);
    }

    #[test]
    fn test_unknown_tables_are_skipped_not_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        let layout = two_chamber_layout();

        conn.execute_batch("CREATE TABLE RunMetadata (key TEXT, value TEXT)")
            .unwrap();
        create_cluster_table(&conn, "GTPCSector1Clusters");

        let batch = read_cluster_tables(&conn, &layout).unwrap();
        assert!(batch.sectors.is_empty());
        assert_eq!(
            batch.skipped_tables,
            vec!["GTPCSector1Clusters".to_string(), "RunMetadata".to_string()]
        );
    }

    #[test]
    fn test_empty_cluster_table_is_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        let layout = two_chamber_layout();
        create_cluster_table(&conn, "VTPC1Sector2Clusters");

        let batch = read_cluster_tables(&conn, &layout).unwrap();
        assert!(batch.sectors.is_empty());
        assert!(batch.skipped_tables.is_empty());
    }
}
