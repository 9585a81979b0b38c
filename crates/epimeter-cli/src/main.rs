use anyhow::Context;
use clap::{Parser, Subcommand};
use epimeter_lib::builder::parse::read_epitopes;
use epimeter_lib::constants::{DEFAULT_LEAF_SIZE, DEFAULT_MAX_K, DEFAULT_MIN_K, DEFAULT_N_TREES};
use epimeter_lib::{
    write_results, EpimeterError, IndexConfig, IndexManager, KmerBounds, KmerIndexer,
    QueryEngine, QueryResult, SearchK,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "epimeter")]
#[command(version = "0.1.0")]
#[command(about = "Substitution-aware nearest-neighbor search over proteome k-mers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the k-mers of a protein FASTA file
    Index {
        /// Protein FASTA/FASTQ file (may be gzipped)
        #[arg(short, long)]
        protein_fasta: PathBuf,

        /// Smallest and largest k-mer length to index
        #[arg(short, long, num_args = 2, value_names = ["MIN_K", "MAX_K"],
              default_values_t = [DEFAULT_MIN_K, DEFAULT_MAX_K])]
        kmer_bounds: Vec<usize>,

        /// Output index directory
        #[arg(short, long)]
        index_name: PathBuf,

        /// Number of trees per shard
        #[arg(long, default_value_t = DEFAULT_N_TREES)]
        n_trees: usize,

        /// Maximum number of k-mers per leaf
        #[arg(long, default_value_t = DEFAULT_LEAF_SIZE)]
        leaf_size: usize,

        /// Seed for reproducible builds (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Substitution matrix file (BLOSUM62 if omitted)
        #[arg(long)]
        scores: Option<PathBuf>,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Find the nearest proteome k-mers of a list of epitopes
    Query {
        /// Index directory
        #[arg(short, long)]
        index_name: PathBuf,

        /// Epitope file, one peptide per line
        #[arg(short, long)]
        epitopes: PathBuf,

        /// Number of neighbors per epitope
        #[arg(short, long, default_value = "50")]
        num_neighbors: usize,

        /// Candidate budget: "auto", "all" or a number of candidates
        #[arg(long, default_value = "auto")]
        search_k: SearchK,

        /// Output file for `id,distance` rows
        #[arg(long, default_value = "nearest_neighbors.csv")]
        distances_out: PathBuf,

        /// Output file for `id,peptide` rows
        #[arg(long, default_value = "peptide_nns.csv")]
        peptides_out: PathBuf,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Show the shards of an index
    Info {
        /// Index directory
        #[arg(short, long)]
        index_name: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            protein_fasta,
            kmer_bounds,
            index_name,
            n_trees,
            leaf_size,
            seed,
            scores,
            threads,
        } => {
            let config = IndexConfig {
                n_trees,
                leaf_size,
                seed,
                num_threads: threads,
            };
            index_command(&protein_fasta, &kmer_bounds, &index_name, config, scores.as_deref())?;
        }
        Commands::Query {
            index_name,
            epitopes,
            num_neighbors,
            search_k,
            distances_out,
            peptides_out,
            threads,
        } => {
            let engine_args = QueryArgs {
                num_neighbors,
                search_k,
                threads,
            };
            query_command(&index_name, &epitopes, engine_args, &distances_out, &peptides_out)?;
        }
        Commands::Info { index_name } => {
            info_command(&index_name)?;
        }
    }

    Ok(())
}

/// Index every k-mer of a protein file and save the index
fn index_command(
    protein_fasta: &Path,
    kmer_bounds: &[usize],
    index_name: &Path,
    config: IndexConfig,
    scores: Option<&Path>,
) -> anyhow::Result<()> {
    let [min_k, max_k] = kmer_bounds else {
        anyhow::bail!("expected two k-mer bounds, got {}", kmer_bounds.len());
    };
    let bounds = KmerBounds::new(*min_k, *max_k)?;

    info!("Indexing proteome k-mers...");
    info!("  Input: {}", protein_fasta.display());
    info!("  k: {}..={}", bounds.min_k(), bounds.max_k());
    info!("  Output: {}", index_name.display());

    let mut manager = IndexManager::with_config(config)?;
    if let Some(scores) = scores {
        manager
            .load_scores_file(scores)
            .with_context(|| format!("Failed to load substitution matrix {}", scores.display()))?;
        info!("  Substitution matrix: {}", scores.display());
    }

    let start = Instant::now();
    let mut indexer = KmerIndexer::new(bounds);
    let stats = indexer.index_fasta(&mut manager, protein_fasta)?;
    if stats.kmers == 0 {
        anyhow::bail!(
            "no k-mers of length {}..={} found in {}",
            bounds.min_k(),
            bounds.max_k(),
            protein_fasta.display()
        );
    }

    manager
        .save(index_name)
        .with_context(|| format!("Failed to save index to {}", index_name.display()))?;

    info!("Index built in {:.2?}", start.elapsed());
    Ok(())
}

struct QueryArgs {
    num_neighbors: usize,
    search_k: SearchK,
    threads: usize,
}

/// Query every epitope of a file and write both result files
fn query_command(
    index_name: &Path,
    epitopes: &Path,
    args: QueryArgs,
    distances_out: &Path,
    peptides_out: &Path,
) -> anyhow::Result<()> {
    let mut manager = IndexManager::new();
    manager
        .load(index_name)
        .with_context(|| format!("Failed to open index {}", index_name.display()))?;

    let epitopes = read_epitopes(epitopes)?;
    info!("Querying {} epitopes", epitopes.len());
    debug!("  num_neighbors = {}, search_k = {}", args.num_neighbors, args.search_k);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .context("Failed to create thread pool")?;

    let engine = QueryEngine::new(&manager)
        .num_neighbors(args.num_neighbors)
        .search_k(args.search_k);

    let start = Instant::now();
    let results = pool.install(|| engine.query_all(&epitopes));
    let elapsed = start.elapsed();

    let mut failed = 0usize;
    let results = epitopes
        .iter()
        .zip(results)
        .map(|(epitope, result)| match result {
            Ok(result) => Ok(result),
            Err(err @ (EpimeterError::Corruption(_) | EpimeterError::Io(_))) => {
                Err(err).with_context(|| format!("Failed to query epitope {}", epitope))
            }
            // the epitope itself is unusable; keep its row so output rows line up with the epitopes
            Err(err) => {
                warn!("Skipping epitope {}: {}", epitope, err);
                failed += 1;
                Ok(QueryResult {
                    epitope: epitope.clone(),
                    neighbors: Vec::new(),
                })
            }
        })
        .collect::<anyhow::Result<Vec<QueryResult>>>()?;
    if failed > 0 {
        warn!("{} of {} epitopes had no result", failed, epitopes.len());
    }

    let mut distances = BufWriter::new(
        File::create(distances_out)
            .with_context(|| format!("Failed to create {}", distances_out.display()))?,
    );
    let mut peptides = BufWriter::new(
        File::create(peptides_out)
            .with_context(|| format!("Failed to create {}", peptides_out.display()))?,
    );
    write_results(&mut distances, &mut peptides, &results)?;
    distances.flush()?;
    peptides.flush()?;

    if !results.is_empty() {
        info!(
            "Answered {} queries in {:.2?} ({:.1} us/query)",
            results.len(),
            elapsed,
            elapsed.as_secs_f64() * 1e6 / results.len() as f64
        );
    }
    info!("Wrote {} and {}", distances_out.display(), peptides_out.display());
    Ok(())
}

/// Print the shards of an index
fn info_command(index_name: &Path) -> anyhow::Result<()> {
    let mut manager = IndexManager::new();
    manager
        .load(index_name)
        .with_context(|| format!("Failed to open index {}", index_name.display()))?;

    let metric = manager.metric();
    println!("index: {}", index_name.display());
    println!("alphabet: {}", String::from_utf8_lossy(metric.alphabet().symbols()));
    println!("weighted: {}", metric.weights().is_some());
    for k in manager.kmer_lengths()? {
        println!("k={}\titems={}", k, manager.num_items(k)?);
    }
    Ok(())
}
