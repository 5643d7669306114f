// rotation_cache.rs

use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::{debug, error, info};
use pathway_pca::diagnostics::row_orthogonality_error;
use pathway_pca::{
    AggregatorConfig, CompoundFile, EnginePool, EnginePoolConfig, PcaFeatureAggregator, RotationCache,
    SingularValueDecomposition, SvdBackendKind, SvdFactory,
};
use std::sync::Arc;

fn main() -> Result<(), Error> {
    let cli_args = cli::CliArgs::parse();

    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();
    debug!("Arguments: {:?}", cli_args);

    match cli_args.command {
        cli::Command::List { compound_file } => commands::list(&compound_file),
        cli::Command::Show { cache_dir, split, endpoint, pathway } => {
            commands::show(&cache_dir, split, &endpoint, &pathway)
        }
        cli::Command::Files { cache_dir, endpoint, pathway } => commands::files(&cache_dir, &endpoint, &pathway),
        cli::Command::Average { cache_dir, endpoint, pathways, backend } => {
            commands::average(&cache_dir, &endpoint, &pathways, &backend)
        }
    }
}

mod cli {
    use clap::{Parser, Subcommand};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Inspect and average cached pathway PCA rotations.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// List the entries of one compound file.
        List { compound_file: PathBuf },

        /// Print a cached rotation: dimensions, feature ids, singular values.
        Show {
            #[arg(short = 'd', long)]
            cache_dir: PathBuf,
            #[arg(short, long, default_value_t = 0)]
            split: u32,
            #[arg(short, long)]
            endpoint: String,
            #[arg(short, long)]
            pathway: String,
        },

        /// Find the rotations of one pathway across all splits.
        Files {
            #[arg(short = 'd', long)]
            cache_dir: PathBuf,
            #[arg(short, long)]
            endpoint: String,
            #[arg(short, long)]
            pathway: String,
        },

        /// Average per-split rotations into the split-0 rotation.
        Average {
            #[arg(short = 'd', long)]
            cache_dir: PathBuf,
            #[arg(short, long)]
            endpoint: String,
            #[arg(short, long = "pathway", required = true)]
            pathways: Vec<String>,
            #[arg(short, long, default_value = "LAPACK")]
            backend: String,
        },
    }
}

mod commands {
    use super::*;
    use std::path::Path;

    pub(crate) fn list(path: &Path) -> Result<()> {
        let compound = CompoundFile::open_read_only(path)
            .with_context(|| format!("Failed to open compound file {}", path.display()))?;
        info!("{} entries in {}", compound.len(), path.display());
        for name in compound.list_entries() {
            println!("{}\t{}", compound.entry_len(&name).unwrap_or(0), name);
        }
        Ok(())
    }

    pub(crate) fn show(cache_dir: &Path, split: u32, endpoint: &str, pathway: &str) -> Result<()> {
        let cache = RotationCache::open(cache_dir, split)?;
        let mut row_ids = Vec::new();
        let rotation = cache
            .get_rotation_matrix(endpoint, pathway, &mut row_ids)
            .ok_or_else(|| anyhow!("No readable rotation for {} / {} in split {}", endpoint, pathway, split))?;

        println!("rotation\t{}", cache.rotation_entry_name(endpoint, pathway));
        println!("components\t{}", rotation.nrows());
        println!("features\t{}", rotation.ncols());
        println!("feature_ids\t{}", row_ids.join(","));

        let svd = SvdFactory::new().create(SvdBackendKind::Lapack)?;
        let decomposition = svd.svd_vectors(rotation.view(), 0, 0)?;
        let values: Vec<String> = decomposition.singular_values().iter().map(|s| format!("{:.6}", s)).collect();
        println!("singular_values\t{}", values.join(","));
        if let Some(err) = row_orthogonality_error(&rotation.view()) {
            println!("orthonormality_error\t{:.3e}", err);
        }
        Ok(())
    }

    pub(crate) fn files(cache_dir: &Path, endpoint: &str, pathway: &str) -> Result<()> {
        let cache = RotationCache::open(cache_dir, 0)?;
        let found = cache.get_rotation_files(endpoint, pathway);
        if found.is_empty() {
            info!("No cached rotations for {} / {}", endpoint, pathway);
        }
        for (path, entries) in found {
            for entry in entries {
                println!("{}\t{}", path.display(), entry);
            }
        }
        Ok(())
    }

    pub(crate) fn average(cache_dir: &Path, endpoint: &str, pathways: &[String], backend: &str) -> Result<()> {
        let backend: SvdBackendKind = backend.parse()?;
        let cache = Arc::new(RotationCache::open(cache_dir, 0)?);
        let pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
        let factory = SvdFactory::new().with_engine_pool(Arc::clone(&pool));
        let config = AggregatorConfig {
            averaging_backend: backend,
            ..AggregatorConfig::new(endpoint)
        };
        let aggregator = PcaFeatureAggregator::new(config, cache, Arc::clone(&pool), factory);

        let mut failures = 0;
        for (pathway, result) in aggregator.average_all(pathways) {
            match result {
                Ok(Some(rotation)) => println!("{}\t{}x{}", pathway, rotation.nrows(), rotation.ncols()),
                Ok(None) => {
                    println!("{}\tno split rotations", pathway);
                    failures += 1;
                }
                Err(e) => {
                    error!("Averaging {} failed: {}", pathway, e);
                    failures += 1;
                }
            }
        }
        pool.shutdown();
        if failures > 0 {
            return Err(anyhow!("{} of {} pathways could not be averaged", failures, pathways.len()));
        }
        Ok(())
    }
}
