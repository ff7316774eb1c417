// ========================================================================================
//
//                               THE TRIOGEN COMMAND LINE
//
// ========================================================================================
//
// Thin wrappers over the library: each subcommand resolves its inputs, builds settings
// and hands off to one library entry point. Errors are printed and exit with status 1.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::process;

use triogen::config::LdSettings;
use triogen::container::{ContainerStream, VariantIndex, default_sidecar_path};
use triogen::pipeline::compute_ld_matrix;
use triogen::prune::{PruneSettings, prune_results};
use triogen::reader::{LdMatrixReader, LdMatrixSet};

#[derive(Args)]
pub struct LdMatrixArgs {
    /// Genotype container to compute LD from
    #[arg(value_name = "CONTAINER")]
    container: PathBuf,

    /// Destination of the LD matrix (.tld)
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Sidecar index of the container (default: <container>.index.gz)
    #[arg(long, value_name = "PATH")]
    index: Option<PathBuf>,

    /// TOML settings file; the flags below override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Largest distance in base pairs between two variants
    #[arg(long, value_name = "BP")]
    max_distance: Option<u32>,

    /// Smallest r² to store
    #[arg(long)]
    min_r2: Option<f64>,

    /// Smallest minor allele frequency of variants entering the computation
    #[arg(long)]
    min_maf: Option<f64>,

    /// Number of worker threads
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Wall-clock budget of the run in days
    #[arg(long, value_name = "DAYS")]
    timeout_days: Option<u64>,

    /// Write the effective settings to this TOML file before running
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,
}

#[derive(Args)]
pub struct LdPruneArgs {
    /// Association results table
    #[arg(value_name = "RESULTS")]
    results: PathBuf,

    /// LD matrix file, with {contig} standing for the contig name
    #[arg(value_name = "MATRIX_TEMPLATE")]
    matrix: String,

    /// Destination of the pruned table
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    #[arg(long, default_value = "0.05")]
    min_r2: f64,

    /// Largest p-value of a hit
    #[arg(long, default_value = "1e-6")]
    max_p: f64,

    #[arg(long, default_value = "variantId")]
    id_column: String,

    #[arg(long, default_value = "contig")]
    contig_column: String,

    #[arg(long, default_value = "h.intercept.p")]
    p_column: String,

    /// Prune each phenotype of this column separately
    #[arg(long)]
    phenotype_column: Option<String>,

    /// Single-byte column separator
    #[arg(long, default_value = "\t")]
    separator: char,
}

#[derive(Parser)]
#[command(
    name = "triogen",
    version,
    about = "Sparse LD matrices and windowed genotype streaming for trio cohorts"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the variant index of a genotype container
    #[command(about = "Index a genotype container (outputs: <container>.index.gz)")]
    Index {
        #[arg(value_name = "CONTAINER")]
        container: PathBuf,

        /// Where to write the index
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Rebuild even when a valid index exists
        #[arg(long)]
        rebuild: bool,
    },

    /// Compute the LD matrix of a genotype container
    #[command(about = "Compute an LD matrix (outputs: .tld)")]
    LdMatrix(LdMatrixArgs),

    /// Print the LD partners of one variant
    #[command(about = "Look up the LD partners of a variant")]
    LdValue {
        #[arg(value_name = "MATRIX")]
        matrix: PathBuf,

        #[arg(value_name = "VARIANT_ID")]
        variant_id: String,

        #[arg(long, default_value = "0.0")]
        min_r2: f64,
    },

    /// Greedily prune association hits that are in LD with stronger hits
    #[command(about = "LD-prune association results")]
    LdPrune(LdPruneArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Index {
            container,
            output,
            rebuild,
        }) => run_index(container, output, rebuild),
        Some(Commands::LdMatrix(args)) => run_ld_matrix(args),
        Some(Commands::LdValue {
            matrix,
            variant_id,
            min_r2,
        }) => run_ld_value(matrix, variant_id, min_r2),
        Some(Commands::LdPrune(args)) => run_ld_prune(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run_index(
    container: PathBuf,
    output: Option<PathBuf>,
    rebuild: bool,
) -> Result<(), Box<dyn Error>> {
    let sidecar = output.unwrap_or_else(|| default_sidecar_path(&container));
    let index = if rebuild {
        let index = VariantIndex::build(&container)?;
        index.persist(&sidecar)?;
        index
    } else {
        VariantIndex::open_or_build(&container, Some(&sidecar))?
    };
    println!(
        "{}\t{} variants\t{} samples\t{}",
        container.display(),
        index.len(),
        index.n_samples(),
        sidecar.display()
    );
    Ok(())
}

fn run_ld_matrix(args: LdMatrixArgs) -> Result<(), Box<dyn Error>> {
    let mut settings = match &args.config {
        Some(path) => LdSettings::load(path)?,
        None => LdSettings::default(),
    };
    if let Some(max_distance) = args.max_distance {
        settings.max_distance = max_distance;
    }
    if let Some(min_r2) = args.min_r2 {
        settings.min_r2 = min_r2;
    }
    if let Some(min_maf) = args.min_maf {
        settings.min_allele_frequency = min_maf;
    }
    if let Some(threads) = args.threads {
        settings.threads = threads;
    }
    if let Some(timeout_days) = args.timeout_days {
        settings.timeout_days = timeout_days;
    }
    settings.validate()?;
    if let Some(path) = &args.save_config {
        settings.save(path)?;
        info!("Saved settings to {}", path.display());
    }

    let stream = ContainerStream::open(&args.container, args.index.as_deref())?;
    let summary = compute_ld_matrix(stream, &args.output, &settings)?;
    println!(
        "{}\t{} variants\t{} blocks\t{} pairs\t{:.1}s",
        summary.matrix.path.display(),
        summary.variants,
        summary.blocks,
        summary.pairs,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

fn run_ld_value(matrix: PathBuf, variant_id: String, min_r2: f64) -> Result<(), Box<dyn Error>> {
    let reader = LdMatrixReader::open(&matrix)?;
    let Some(partners) = reader.get_r2_above(&variant_id, min_r2)? else {
        println!("No LD recorded for {variant_id} in {}", matrix.display());
        return Ok(());
    };
    let mut partners: Vec<(String, f64)> = partners.into_iter().collect();
    partners.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    println!("variant_id\talias\tr2");
    for (partner, r2) in partners {
        let alias = reader.alias(&partner).unwrap_or("");
        println!("{partner}\t{alias}\t{r2}");
    }
    Ok(())
}

fn run_ld_prune(args: LdPruneArgs) -> Result<(), Box<dyn Error>> {
    let delimiter = u8::try_from(args.separator)
        .map_err(|_| format!("separator {:?} is not a single byte", args.separator))?;
    let settings = PruneSettings {
        min_r2: args.min_r2,
        max_p: args.max_p,
        id_column: args.id_column,
        contig_column: args.contig_column,
        p_column: args.p_column,
        phenotype_column: args.phenotype_column,
        delimiter,
    };
    let summary = prune_results(
        &args.results,
        &LdMatrixSet::new(args.matrix),
        &args.output,
        &settings,
    )?;
    println!(
        "{}\t{} hits\t{} kept\t{} contigs without LD matrix",
        args.output.display(),
        summary.hits,
        summary.kept,
        summary.skipped_contigs
    );
    Ok(())
}
