use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sd_disk_cache::{
	dump::{copy_entries, dump_to_dir},
	Backend, BackendConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Copy every entry of a cache into another one, creating it if needed
	Copy { src: PathBuf, dst: PathBuf },
	/// Write every entry as flat files plus a JSON manifest
	Dump { src: PathBuf, out: PathBuf },
	/// Print the counters of a cache
	Stats { dir: PathBuf },
}

async fn open(dir: PathBuf) -> anyhow::Result<Backend> {
	let display = dir.display().to_string();
	Backend::open(BackendConfig::new(dir))
		.await
		.with_context(|| format!("failed to open cache at '{display}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	match Cli::parse().command {
		Commands::Copy { src, dst } => {
			let src = open(src).await?;
			let dst = open(dst).await?;

			let copied = copy_entries(&src, &dst).await?;
			info!(copied, "Copy finished");

			src.shutdown().await?;
			dst.shutdown().await?;
		}
		Commands::Dump { src, out } => {
			let src = open(src).await?;

			let manifest = dump_to_dir(&src, &out).await?;
			info!(
				entries = manifest.entries.len(),
				out = %out.display(),
				"Dump finished"
			);

			src.shutdown().await?;
		}
		Commands::Stats { dir } => {
			let backend = open(dir).await?;

			let stats = backend.stats().await?;
			let width = stats.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
			for (name, value) in stats {
				println!("{name:<width$}  {value}");
			}

			backend.shutdown().await?;
		}
	}

	Ok(())
}
