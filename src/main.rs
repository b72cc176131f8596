use bundlefs::archive::{Archive, ReadOptions};
use bundlefs::codec::CompressionKind;
use bundlefs::writer::WriteOptions;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bundlefs", about = "Inspect, unpack and re-pack asset bundles")]
struct Cli {
    /// Log pipeline stages (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, block table and directory
    Info {
        input: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List entries
    List {
        input: PathBuf,
    },
    /// Write every entry of one or more bundles to a directory
    Unpack {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Read a bundle and write it back out
    Repack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Force one codec for every block: none, lzma, lz4, lz4hc
        #[arg(short, long)]
        codec: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let ar = Archive::open(&input)?;
            let h = ar.header();
            if json {
                let doc = serde_json::json!({
                    "path":      input.display().to_string(),
                    "header":    h,
                    "hash":      hex::encode(ar.hash()),
                    "blocks":    ar.blocks(),
                    "directory": ar.directory(),
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
                return Ok(());
            }

            println!("── Bundle ───────────────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  Signature       {}", h.signature.as_str());
            println!("  Format version  {}", h.version);
            println!("  Engine          {} / {}", h.engine_version, h.engine_revision);
            println!("  Size            {} B", h.size);
            println!("  Flags           {:#06x}", h.flags.0);
            println!("  BlocksInfo      {} B packed, {} B raw",
                     h.compressed_blocks_info_size, h.uncompressed_blocks_info_size);
            println!("  Hash            {}", hex::encode(ar.hash()));
            println!("  Logical stream  {} B", ar.logical_len());
            println!("  Blocks ({}):", ar.blocks().len());
            for b in ar.blocks() {
                let codec = b.compression().map(|k| k.name()).unwrap_or("UNKNOWN");
                println!("    {:>10} -> {:>10}  {}", b.compressed_size, b.uncompressed_size, codec);
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let ar = Archive::open(&input)?;
            println!("Bundle: {}", input.display());
            println!("{:<48} {:>12} {:>12} {:>6}", "Path", "Offset", "Size", "Flags");
            for e in ar.directory() {
                println!("{:<48} {:>12} {:>12} {:>6}", e.path, e.offset, e.size, e.flags);
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir } => {
            let per_archive_dir = input.len() > 1;
            let jobs: Vec<(PathBuf, PathBuf)> = input
                .into_iter()
                .map(|path| {
                    let dest = if per_archive_dir {
                        output_dir.join(path.file_name().unwrap_or(path.as_os_str()))
                    } else {
                        output_dir.clone()
                    };
                    (path, dest)
                })
                .collect();

            #[cfg(feature = "parallel")]
            let results: Vec<_> = {
                use rayon::prelude::*;
                jobs.par_iter().map(|(src, dest)| unpack_one(src, dest)).collect()
            };
            #[cfg(not(feature = "parallel"))]
            let results: Vec<_> = jobs.iter().map(|(src, dest)| unpack_one(src, dest)).collect();

            for ((src, dest), result) in jobs.iter().zip(results) {
                match result {
                    Ok(n)  => println!("  unpacked  {} ({n} entries) -> {}", src.display(), dest.display()),
                    Err(e) => return Err(format!("{}: {e}", src.display()).into()),
                }
            }
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack { input, output, codec } => {
            let mut opts = WriteOptions::default();
            if let Some(name) = codec {
                opts.compression = Some(
                    CompressionKind::from_name(&name)
                        .ok_or_else(|| format!("unknown codec '{name}'"))?,
                );
            }
            let mut ar = Archive::open(&input)?;
            ar.write_to_path(&output, &opts)?;
            println!("Repacked → {}", output.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "bundlefs=debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn unpack_one(src: &Path, dest: &Path) -> bundlefs::Result<usize> {
    // Oversized entries spill straight into `dest` and are not copied again.
    let opts = ReadOptions { unpack_dir: Some(dest.to_owned()), ..ReadOptions::for_archive(src) };
    Archive::open_with_options(src, &opts)?.extract_all(dest)
}
