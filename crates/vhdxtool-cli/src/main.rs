//! vhdxtool CLI - Inspect, extract and create VHDX disk images.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use vhdxtool_core::format::VhdxHeader;
use vhdxtool_core::{
    BackingStore, CreateOptions, DiskImageFile, DiskImageInfo, Extent, OpenOptions, ParentDisk,
    VirtualDisk,
};

/// Copy buffer size for extraction.
const COPY_CHUNK: u64 = 1024 * 1024;

/// Longest differencing chain followed when resolving parents.
const MAX_PARENT_DEPTH: usize = 16;

/// Tool for inspecting, extracting and creating VHDX disk images.
#[derive(Parser)]
#[command(name = "vhdxtool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display headers, regions, metadata and log of a VHDX file.
    Info {
        /// Path to the VHDX file.
        file: PathBuf,
    },

    /// List the stored extents of the virtual disk.
    Extents {
        /// Path to the VHDX file.
        file: PathBuf,

        /// Parent image of a differencing disk. Found via the parent locator if omitted.
        #[arg(short, long)]
        parent: Option<PathBuf>,
    },

    /// Copy the virtual disk to a raw image.
    Extract {
        /// Path to the VHDX file.
        file: PathBuf,

        /// Output raw image path.
        output: PathBuf,

        /// Parent image of a differencing disk. Found via the parent locator if omitted.
        #[arg(short, long)]
        parent: Option<PathBuf>,

        /// Print the SHA-256 digest of the virtual disk content.
        #[arg(long)]
        sha256: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Create an empty dynamic or differencing VHDX file.
    Create {
        /// Path of the new VHDX file.
        file: PathBuf,

        /// Virtual disk size, in bytes or with a K/M/G/T suffix. Taken from the parent if omitted.
        #[arg(short, long, value_parser = parse_size)]
        size: Option<u64>,

        /// Block size in megabytes.
        #[arg(short, long, default_value = "32")]
        block_size: u64,

        /// Create a differencing disk over this VHDX parent.
        #[arg(short, long)]
        parent: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Info { file } => {
            show_info(&file)?;
        }
        Commands::Extents { file, parent } => {
            list_extents(&file, parent.as_deref())?;
        }
        Commands::Extract {
            file,
            output,
            parent,
            sha256,
            quiet,
        } => {
            run_extract(&file, &output, parent.as_deref(), sha256, quiet)?;
        }
        Commands::Create {
            file,
            size,
            block_size,
            parent,
        } => {
            run_create(&file, size, block_size, parent.as_deref())?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn show_info(file: &Path) -> Result<()> {
    let mut image = DiskImageFile::open_path(file, OpenOptions::read_only())
        .with_context(|| format!("failed to open {}", file.display()))?;
    let info = image.info()?;

    println!("VHDX File Information");
    println!("=====================");
    println!();
    println!("File:      {}", file.display());
    println!("Creator:   {}", info.creator);
    println!("File size: {}", format_bytes(info.file_size));
    println!();

    for (i, header) in info.headers.iter().enumerate() {
        let slot = i as u8 + 1;
        let active = if slot == info.active_header { " (active)" } else { "" };
        match header {
            Some(header) => print_header(slot, active, header),
            None => println!("Header {}: invalid", slot),
        }
        println!();
    }

    print_regions(&info);
    print_metadata(&info);
    print_log(&info);

    if image.is_differencing() {
        println!("Parent locations:");
        for location in image.parent_locations(file.parent())? {
            println!("  {}", location);
        }
    }

    Ok(())
}

fn print_header(slot: u8, active: &str, header: &VhdxHeader) {
    println!("Header {}{}:", slot, active);
    println!("  Sequence:        {}", header.sequence_number);
    println!("  File write GUID: {}", header.file_write_guid);
    println!("  Data write GUID: {}", header.data_write_guid);
    println!("  Log GUID:        {}", header.log_guid);
    println!("  Log:             {} at offset {}", format_bytes(header.log_length as u64), header.log_offset);
}

fn print_regions(info: &DiskImageInfo) {
    println!("Regions:");
    for entry in &info.region_table.entries {
        println!(
            "  {} {:<16} offset {:>12} length {:>10}{}",
            entry.guid,
            entry.well_known_name().unwrap_or("unknown"),
            entry.file_offset,
            entry.length,
            if entry.is_required() { " required" } else { "" }
        );
    }
    println!();
}

fn print_metadata(info: &DiskImageInfo) {
    let metadata = &info.metadata;
    println!("Metadata:");
    println!("  Disk size:            {}", format_bytes(metadata.disk_size));
    println!(
        "  Block size:           {}",
        format_bytes(metadata.file_parameters.block_size as u64)
    );
    println!("  Logical sector size:  {}", metadata.logical_sector_size);
    println!("  Physical sector size: {}", metadata.physical_sector_size);
    println!("  Leave blocks allocated: {}", metadata.file_parameters.leave_blocks_allocated);
    println!("  Has parent:           {}", metadata.file_parameters.has_parent);
    println!("  Page 83 data:         {}", metadata.page83_data);
    println!("  Items:");
    for entry in &metadata.table.entries {
        println!(
            "    {} {:<22} offset {:>8} length {:>6} flags 0x{:X}",
            entry.item_id,
            entry.well_known_name().unwrap_or("unknown"),
            entry.offset,
            entry.length,
            entry.flags
        );
    }
    if let Some(locator) = &metadata.parent_locator {
        println!("  Parent locator ({}):", locator.locator_type);
        for (key, value) in &locator.entries {
            println!("    {} = {}", key, value);
        }
    }
    println!();
}

fn print_log(info: &DiskImageInfo) {
    if info.log_entries.is_empty() {
        println!("Log:       clean");
        println!();
        return;
    }
    println!("Log ({} entries):", info.log_entries.len());
    for entry in &info.log_entries {
        println!(
            "  #{} at {} tail {} flushed {} last {}",
            entry.sequence_number,
            entry.position,
            entry.tail,
            entry.flushed_file_offset,
            entry.last_file_offset
        );
        for extent in &entry.modified_extents {
            println!("    writes {} bytes at {}", extent.length, extent.start);
        }
    }
    println!();
}

/// Opens the logical disk of `file`, attaching its parent chain.
fn open_disk(file: &Path, parent: Option<&Path>, depth: usize) -> Result<Box<dyn VirtualDisk>> {
    if depth > MAX_PARENT_DEPTH {
        bail!("differencing chain deeper than {} images", MAX_PARENT_DEPTH);
    }
    let image = DiskImageFile::open_path(file, OpenOptions::read_only())
        .with_context(|| format!("failed to open {}", file.display()))?;

    let parent = if image.is_differencing() {
        let path = match parent {
            Some(path) => path.to_path_buf(),
            None => find_parent(&image, file)?,
        };
        debug!(parent = %path.display(), "opening parent");
        Some(ParentDisk::Owned(open_disk(&path, None, depth + 1)?))
    } else {
        if parent.is_some() {
            warn!("{} is not a differencing disk; ignoring --parent", file.display());
        }
        None
    };

    Ok(Box::new(image.open_content(parent)))
}

fn find_parent<S: BackingStore>(image: &DiskImageFile<S>, file: &Path) -> Result<PathBuf> {
    let candidates = image.parent_locations(file.parent())?;
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .with_context(|| {
            format!(
                "parent of {} not found (tried: {}); pass --parent",
                file.display(),
                candidates.join(", ")
            )
        })
}

fn list_extents(file: &Path, parent: Option<&Path>) -> Result<()> {
    let mut disk = open_disk(file, parent, 0)?;
    let capacity = disk.capacity();
    let extents = disk.extents_in_range(0, capacity)?;

    let stored: u64 = extents.iter().map(|e| e.length).sum();
    for extent in &extents {
        println!(
            "{:>16} {:>16} ({})",
            extent.start,
            extent.length,
            format_bytes(extent.length)
        );
    }
    println!();
    println!(
        "{} extents, {} of {} stored",
        extents.len(),
        format_bytes(stored),
        format_bytes(capacity)
    );
    Ok(())
}

fn run_extract(file: &Path, output: &Path, parent: Option<&Path>, sha256: bool, quiet: bool) -> Result<()> {
    let mut disk = open_disk(file, parent, 0)?;
    let capacity = disk.capacity();
    let extents = disk.extents_in_range(0, capacity)?;

    let mut out = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    out.set_len(capacity)?;

    let progress = if quiet {
        None
    } else {
        let pb = ProgressBar::new(capacity);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let mut hasher = sha256.then(Sha256::new);
    let zeros = vec![0u8; COPY_CHUNK as usize];
    let mut buf = vec![0u8; COPY_CHUNK as usize];
    let mut pos = 0u64;
    let end = Extent::new(capacity, 0);

    for extent in extents.iter().chain(std::iter::once(&end)) {
        // Unstored gap: the output is already sparse zeros.
        while pos < extent.start {
            let n = (extent.start - pos).min(COPY_CHUNK);
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&zeros[..n as usize]);
            }
            pos += n;
            if let Some(pb) = &progress {
                pb.set_position(pos);
            }
        }

        while pos < extent.end() {
            let n = (extent.end() - pos).min(COPY_CHUNK) as usize;
            let read = disk.read_at(pos, &mut buf[..n])?;
            if read != n {
                bail!("short read at offset {}", pos);
            }
            out.write_all_at(pos, &buf[..n])?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buf[..n]);
            }
            pos += n as u64;
            if let Some(pb) = &progress {
                pb.set_position(pos);
            }
        }
    }
    BackingStore::flush(&mut out)?;

    if let Some(pb) = progress {
        pb.finish_with_message("Complete!");
    }

    if !quiet {
        let stored: u64 = extents.iter().map(|e| e.length).sum();
        println!();
        println!("Extracted {} to {}", format_bytes(capacity), output.display());
        println!("Stored data: {}", format_bytes(stored));
    }
    if let Some(hasher) = hasher {
        println!("SHA256: {}", digest_hex(hasher));
    }

    Ok(())
}

fn run_create(file: &Path, size: Option<u64>, block_size_mb: u64, parent: Option<&Path>) -> Result<()> {
    let options = CreateOptions::default().with_block_size(block_size_mb * 1024 * 1024);

    let image = match parent {
        Some(parent_path) => {
            let parent_image = DiskImageFile::open_path(parent_path, OpenOptions::read_only())
                .with_context(|| format!("failed to open parent {}", parent_path.display()))?;
            if let Some(size) = size {
                if size != parent_image.capacity() {
                    bail!(
                        "differencing disk size must match the parent ({} bytes)",
                        parent_image.capacity()
                    );
                }
            }

            let absolute = std::fs::canonicalize(parent_path)?;
            let mut parent_info = parent_image
                .as_parent()
                .with_absolute_win32_path(absolute.to_string_lossy());
            if let Some(relative) = relative_to(&absolute, file) {
                parent_info = parent_info.with_relative_path(relative);
            }
            DiskImageFile::create_differencing_path(file, &parent_info, options)?
        }
        None => {
            let Some(size) = size else {
                bail!("--size is required for a dynamic disk");
            };
            DiskImageFile::create_path(file, CreateOptions { capacity: size, ..options })?
        }
    };

    println!("Created {}", file.display());
    println!("Capacity:   {}", format_bytes(image.capacity()));
    println!("Block size: {}", format_bytes(image.block_size()));
    if image.is_differencing() {
        println!("Parent:     {}", image.parent_locations(file.parent())?.join(", "));
    }
    Ok(())
}

/// Windows-style `.\name` path of `parent` when it sits in the directory of `child`.
fn relative_to(parent: &Path, child: &Path) -> Option<String> {
    let child_dir = std::fs::canonicalize(child.parent()?.join(".")).ok()?;
    let rest = parent.strip_prefix(child_dir).ok()?;
    let parts: Vec<String> = rest
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!(".\\{}", parts.join("\\")))
}

/// Parse a size with an optional K/M/G/T suffix.
fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(format!("unknown size suffix '{}'", c)),
            };
            (&value[..i], multiplier)
        }
        _ => (value, 1),
    };
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

fn digest_hex(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
