//! # barecat CLI
//!
//! Command-line tooling around the archive engine: build archives from
//! path lists or directory trees, extract them back out, compact them and
//! check their integrity.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use barecat::{Barecat, DefragMode, Metadata, OpenMode};

/// Aggregate storage for very large collections of small files.
#[derive(Parser)]
#[command(name = "barecat")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an archive from a list of file paths read from stdin.
    Create {
        /// Archive base path (index and shards get suffixed names).
        base: PathBuf,

        /// Paths on stdin are NUL-separated (as produced by `find -print0`)
        /// instead of newline-separated.
        #[arg(short = '0', long)]
        null: bool,

        /// Maximum shard size, e.g. `32G`, `500M` or a byte count.
        #[arg(long, value_parser = parse_size)]
        shard_size_limit: Option<u64>,

        /// Replace an existing archive instead of refusing to.
        #[arg(long)]
        overwrite: bool,
    },

    /// Build an archive from whole directory trees.
    CreateRecursive {
        /// Archive base path.
        base: PathBuf,

        /// Directories to ingest; each is stored under its own name.
        #[arg(value_name = "DIR", required = true)]
        roots: Vec<PathBuf>,

        #[arg(long, value_parser = parse_size)]
        shard_size_limit: Option<u64>,

        #[arg(long)]
        overwrite: bool,
    },

    /// Extract an archive into a directory.
    Extract {
        base: PathBuf,

        /// Destination directory (created if missing).
        out_dir: PathBuf,
    },

    /// Compact the shard files, reclaiming unreferenced bytes.
    Defrag {
        base: PathBuf,

        /// First-fit-from-the-end instead of the exhaustive forward pack.
        #[arg(long)]
        quick: bool,
    },

    /// Check stored checksums and directory aggregates.
    Verify { base: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("barecat: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Create {
            base,
            null,
            shard_size_limit,
            overwrite,
        } => {
            let mut archive = open_writer(&base, shard_size_limit, overwrite)?;
            let count = ingest_stdin_list(&mut archive, null)?;
            archive.close()?;
            eprintln!("stored {count} files in {}", base.display());
            Ok(())
        }
        Commands::CreateRecursive {
            base,
            roots,
            shard_size_limit,
            overwrite,
        } => {
            let mut archive = open_writer(&base, shard_size_limit, overwrite)?;
            let mut count = 0u64;
            for root in &roots {
                count += ingest_tree(&mut archive, root)?;
            }
            archive.close()?;
            eprintln!("stored {count} files in {}", base.display());
            Ok(())
        }
        Commands::Extract { base, out_dir } => {
            let archive = Barecat::open(&base)?;
            extract_all(&archive, &out_dir)?;
            archive.close()
        }
        Commands::Defrag { base, quick } => {
            let mut archive = Barecat::builder(&base).mode(OpenMode::ReadWrite).open()?;
            let mode = if quick {
                DefragMode::Quick
            } else {
                DefragMode::Full
            };
            let freed = archive.defrag(mode)?;
            archive.close()?;
            eprintln!("reclaimed {freed} bytes");
            Ok(())
        }
        Commands::Verify { base } => {
            let archive = Barecat::open(&base)?;
            let issues = archive.verify(None)?;
            archive.close()?;
            if issues.is_empty() {
                eprintln!("archive is consistent");
                return Ok(());
            }
            for issue in &issues {
                eprintln!("{issue}");
            }
            bail!("{} integrity problems found", issues.len());
        }
    }
}

fn open_writer(base: &Path, shard_size_limit: Option<u64>, overwrite: bool) -> Result<Barecat> {
    let mut builder = Barecat::builder(base).mode(if overwrite {
        OpenMode::Overwrite
    } else {
        OpenMode::CreateNew
    });
    if let Some(limit) = shard_size_limit {
        builder = builder.shard_size_limit(limit);
    }
    builder.open()
}

fn ingest_stdin_list(archive: &mut Barecat, null_separated: bool) -> Result<u64> {
    let mut input = Vec::new();
    io::stdin()
        .lock()
        .read_to_end(&mut input)
        .wrap_err("failed to read path list from stdin")?;
    let separator = if null_separated { b'\0' } else { b'\n' };

    let mut count = 0u64;
    for chunk in input.split(|&b| b == separator) {
        let entry = std::str::from_utf8(chunk)
            .wrap_err("path list is not valid UTF-8")?
            .trim_end_matches('\r');
        if entry.is_empty() {
            continue;
        }
        let host_path = Path::new(entry);
        let store_path = entry.strip_prefix("./").unwrap_or(entry);
        ingest_file(archive, host_path, store_path)?;
        count += 1;
    }
    Ok(count)
}

fn ingest_tree(archive: &mut Barecat, root: &Path) -> Result<u64> {
    let root_name = root
        .file_name()
        .ok_or_else(|| eyre::eyre!("cannot ingest '{}': no directory name", root.display()))?
        .to_string_lossy()
        .into_owned();

    let mut count = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.wrap_err_with(|| format!("failed to walk '{}'", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        let store_path = if relative.as_os_str().is_empty() {
            root_name.clone()
        } else {
            format!("{root_name}/{}", relative.to_string_lossy())
        };

        if entry.file_type().is_dir() {
            archive.mkdir_all(&store_path, host_metadata(entry.path())?)?;
        } else if entry.file_type().is_file() {
            ingest_file(archive, entry.path(), &store_path)?;
            count += 1;
        }
        // Symlinks and special files are not representable; skip them.
    }
    Ok(count)
}

fn ingest_file(archive: &mut Barecat, host_path: &Path, store_path: &str) -> Result<()> {
    let meta = host_metadata(host_path)?;
    let size = fs::metadata(host_path)
        .wrap_err_with(|| format!("failed to stat '{}'", host_path.display()))?
        .len();
    let mut file = fs::File::open(host_path)
        .wrap_err_with(|| format!("failed to open '{}'", host_path.display()))?;
    archive
        .write_from_reader(store_path, &mut file, Some(size), meta)
        .wrap_err_with(|| format!("failed to store '{}'", host_path.display()))?;
    Ok(())
}

fn host_metadata(path: &Path) -> Result<Metadata> {
    let meta = fs::metadata(path)
        .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
    Ok(Metadata {
        mode: Some(meta.mode()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        mtime_ns: Some(meta.mtime() * 1_000_000_000 + meta.mtime_nsec()),
    })
}

fn extract_all(archive: &Barecat, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .wrap_err_with(|| format!("failed to create '{}'", out_dir.display()))?;
    for item in archive.walk("")? {
        let (dir, _subdirs, files) = item?;
        let host_dir = out_dir.join(&dir.path);
        fs::create_dir_all(&host_dir)
            .wrap_err_with(|| format!("failed to create '{}'", host_dir.display()))?;
        for fi in files {
            let host_path = out_dir.join(&fi.path);
            let mut stream = archive.open_stream(&fi.path)?;
            let mut out = fs::File::create(&host_path)
                .wrap_err_with(|| format!("failed to create '{}'", host_path.display()))?;
            io::copy(&mut stream, &mut out)
                .wrap_err_with(|| format!("failed to extract '{}'", fi.path))?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Parses a size with an optional K/M/G/T suffix (powers of 1024).
fn parse_size(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let (digits, factor) = match input.chars().last() {
        Some('K' | 'k') => (&input[..input.len() - 1], 1u64 << 10),
        Some('M' | 'm') => (&input[..input.len() - 1], 1u64 << 20),
        Some('G' | 'g') => (&input[..input.len() - 1], 1u64 << 30),
        Some('T' | 't') => (&input[..input.len() - 1], 1u64 << 40),
        _ => (input, 1),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{input}'"))?;
    if value < 0.0 {
        return Err(format!("invalid size '{input}'"));
    }
    Ok((value * factor as f64) as u64)
}
