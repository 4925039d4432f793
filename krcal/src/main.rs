use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;

use krcal::calib::accumulator::SpectrumAccumulator;
use krcal::calib::audit::write_json_lines;
use krcal::calib::pipeline::analyze;
use krcal::calib::table::{read_gain_table, write_gain_table};
use krcal::data::events::read_cluster_file;
use krcal::data::geometry::TpcLayout;
use krcore::config::KryptonConfig;

/// Derives pad-by-pad relative gain corrections from krypton decay
/// cluster spectra.
#[derive(Parser, Debug)]
#[command(name = "krcal", version)]
struct Args {
    /// Prefix for all output files
    #[arg(short = 'o', long = "output-prefix")]
    output_prefix: String,

    /// JSON configuration file; defaults apply when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// JSON geometry layout file
    #[arg(short = 'g', long = "geometry")]
    geometry: PathBuf,

    /// Previously derived gain table; supplying one enables update mode
    #[arg(short = 'u', long = "update-gains")]
    update_gains: Option<PathBuf>,

    /// Input cluster files (SQLite)
    #[arg(short = 'i', long = "input-files", num_args = 1.., required = true)]
    input_files: Vec<PathBuf>,
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| format!("cannot open config {}: {}", path.display(), e))?;
            let config: KryptonConfig = serde_json::from_reader(BufReader::new(file))?;
            println!("[INFO] User-provided config file: {}", path.display());
            config
        }
        None => KryptonConfig::default(),
    };

    let update_gains = args.update_gains.is_some();
    println!(
        "[INFO] Number of input files: {}. Update previously-calculated gains? {}",
        args.input_files.len(),
        update_gains
    );

    let mut layout = TpcLayout::from_file(&args.geometry)?;
    if let Some(path) = &args.update_gains {
        println!("[INFO] User-provided gains file: {}", path.display());
        let priors = read_gain_table(path, &layout)?;
        layout.attach_prior_gains(&priors);
    }

    let mut accumulator = SpectrumAccumulator::new(&layout, &config, update_gains);

    // Accumulation pass, file by file, with progress at 5% steps.
    let n_files = args.input_files.len();
    let mut previous_percentage = 0;
    for (index, path) in args.input_files.iter().enumerate() {
        let percentage = 100 * index / n_files;
        if percentage != previous_percentage && percentage % 5 == 0 {
            println!(
                "[INFO] Processing file {} / {} ({}% complete).",
                index + 1,
                n_files,
                percentage
            );
        }
        previous_percentage = percentage;

        let batch = match read_cluster_file(path, &layout) {
            Ok(batch) => batch,
            Err(e) => {
                eprintln!(
                    "[WARNING] Error reading input file {}: {}. Skipping.",
                    path.display(),
                    e
                );
                continue;
            }
        };
        for name in &batch.skipped_tables {
            eprintln!("[WARNING] Ignoring table {} in {}.", name, path.display());
        }
        for sector in &batch.sectors {
            if !config.is_selected(sector.tpc) {
                continue;
            }
            for cluster in &sector.clusters {
                accumulator.accumulate(sector.tpc, sector.sector, cluster);
            }
        }
    }

    if accumulator.dropped() > 0 {
        eprintln!(
            "[WARNING] Dropped {} clusters referencing pads the geometry does not have.",
            accumulator.dropped()
        );
    }
    if accumulator.total_entries() == 0 {
        eprintln!(
            "[WARNING] No spectra were filled. Was your TPC included in the configured list?"
        );
    }

    let result = analyze(&accumulator, &layout, &config, update_gains)?;

    let table_path = format!("{}-KryptonPadGains.xml", args.output_prefix);
    let mut table_file = BufWriter::new(File::create(&table_path)?);
    write_gain_table(&mut table_file, &layout, &result.records)?;
    table_file.flush()?;
    println!("[INFO] Pad gains written to file {} . Thanks!", table_path);

    let audit_path = format!("{}-KryptonResults.jsonl", args.output_prefix);
    let mut audit_file = BufWriter::new(File::create(&audit_path)?);
    write_json_lines(&mut audit_file, &result.audit_rows)?;
    audit_file.flush()?;
    println!("[INFO] Audit table written to file {}.", audit_path);

    let sectors_path = format!("{}-KryptonSectors.jsonl", args.output_prefix);
    let mut sectors_file = BufWriter::new(File::create(&sectors_path)?);
    write_json_lines(&mut sectors_file, &result.sector_summaries)?;
    sectors_file.flush()?;
    println!("[INFO] Sector summaries written to file {}.", sectors_path);

    Ok(())
}
