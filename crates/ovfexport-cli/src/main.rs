//! ovfexport CLI - Export VMs and their disks to OVF packages.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use ovfexport_core::{
    get_vm_info, CompressionLevel, EventKind, EventSink, ExportConfig, ExportFlags, ExportJob,
    Exporter, LocalBackend, Stage, VmInfo,
};
use tracing_subscriber::EnvFilter;

/// Export hypervisor VMs to OVF packages with compressed disk images.
#[derive(Parser)]
#[command(name = "ovfexport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export one or more VMs into a single package.
    Export {
        /// Backend directory containing inventory.json and the disk contents.
        #[arg(long)]
        inventory: PathBuf,

        /// VM uuid or name; repeat to export several VMs.
        #[arg(long = "vm", required = true)]
        vms: Vec<String>,

        /// Destination directory for the descriptor and images.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Package name. Defaults to the first VM identifier.
        #[arg(long)]
        name: Option<String>,

        /// Write metadata only; copy no disk content.
        #[arg(long)]
        metadata_only: bool,

        /// Re-read every image after writing it.
        #[arg(long)]
        verify: bool,

        /// Do not save the descriptor.
        #[arg(long)]
        no_save: bool,

        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Compression level (fast, balanced, max).
        #[arg(short, long, value_enum)]
        compression: Option<CompressionArg>,

        /// Number of compression threads (0 = auto-detect).
        #[arg(short, long)]
        threads: Option<usize>,

        /// Streaming chunk size in megabytes.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a VM.
    Info {
        /// Backend directory containing inventory.json.
        #[arg(long)]
        inventory: PathBuf,

        /// VM uuid or name.
        #[arg(long)]
        vm: String,
    },
}

/// Compression level argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl From<CompressionArg> for CompressionLevel {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Fast => CompressionLevel::Fast,
            CompressionArg::Balanced => CompressionLevel::Balanced,
            CompressionArg::Max => CompressionLevel::Max,
        }
    }
}

struct ExportArgs {
    inventory: PathBuf,
    vms: Vec<String>,
    output: PathBuf,
    name: Option<String>,
    flags: ExportFlags,
    config: Option<PathBuf>,
    compression: Option<CompressionArg>,
    threads: Option<usize>,
    chunk_size_mb: Option<usize>,
    quiet: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Export {
            inventory,
            vms,
            output,
            name,
            metadata_only,
            verify,
            no_save,
            config,
            compression,
            threads,
            chunk_size,
            quiet,
        } => {
            run_export(ExportArgs {
                inventory,
                vms,
                output,
                name,
                flags: ExportFlags {
                    metadata_only,
                    verify_disks: verify,
                    auto_save: !no_save,
                },
                config,
                compression,
                threads,
                chunk_size_mb: chunk_size,
                quiet,
            })?;
        }
        Commands::Info { inventory, vm } => {
            show_info(&inventory, &vm)?;
        }
    }

    Ok(())
}

fn load_config(args: &ExportArgs) -> Result<ExportConfig> {
    let mut config = match &args.config {
        Some(path) => ExportConfig::load(path)
            .with_context(|| format!("failed to load configuration '{}'", path.display()))?,
        None => ExportConfig::default(),
    };
    if let Some(compression) = args.compression {
        config.compression = compression.into();
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(mb) = args.chunk_size_mb {
        config.chunk_size = mb * 1024 * 1024;
    }
    config.validate()?;
    tracing::debug!(?config, "effective configuration");
    Ok(config)
}

fn run_export(args: ExportArgs) -> Result<()> {
    let config = load_config(&args)?;
    let backend = LocalBackend::load(&args.inventory)
        .with_context(|| format!("failed to load backend '{}'", args.inventory.display()))?;

    let package_name = args
        .name
        .clone()
        .unwrap_or_else(|| args.vms[0].clone());

    // Show what is about to be exported
    let mut total_bytes = 0u64;
    for identifier in &args.vms {
        let info = get_vm_info(&backend, identifier)?;
        if !args.quiet {
            print_summary(&info);
            println!();
        }
        total_bytes += info.total_disk_size;
    }
    if args.flags.metadata_only {
        total_bytes = 0;
    }

    if !args.quiet {
        println!("Package:     {}", package_name);
        println!("Output:      {}", args.output.display());
        println!("Compression: {:?}", config.compression);
        println!();
    }

    let (events, rx) = EventSink::channel();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, config, events)?;
    let job = ExportJob::new(&args.output, &package_name, args.vms.clone()).with_flags(args.flags);

    let worker = thread::spawn(move || exporter.run(job));

    // Set up progress tracking
    let progress_bar = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(total_bytes);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    };

    // Bytes of disks already torn down, plus the disk in flight
    let mut finished_bytes = 0u64;
    let mut current_bytes = 0u64;
    for event in rx.iter() {
        match event.kind {
            EventKind::Progress => {
                if let Some(progress) = event.progress {
                    current_bytes = progress.bytes_done;
                }
                progress_bar.set_position(finished_bytes + current_bytes);
            }
            EventKind::StageChanged => match event.stage {
                Some(Stage::Teardown) => {
                    finished_bytes += current_bytes;
                    current_bytes = 0;
                }
                Some(stage) => progress_bar.set_message(format!("{} {}", stage, event.subject)),
                None => {}
            },
            EventKind::Warning => {
                progress_bar.println(format!("warning: {}: {}", event.subject, event.message))
            }
            EventKind::Failure => progress_bar.println(format!(
                "error: {}: {}{}",
                event.subject,
                event.message,
                event
                    .cause
                    .as_deref()
                    .map(|c| format!(" ({})", c))
                    .unwrap_or_default()
            )),
            EventKind::Complete => progress_bar.finish_with_message(event.message),
        }
    }

    let result = worker
        .join()
        .map_err(|_| anyhow!("export worker panicked"))??;

    if !args.quiet {
        println!();
        println!("Images written: {}", result.disk_files.len());
        for outcome in &result.outcomes {
            let renamed = outcome
                .collision
                .as_ref()
                .map(|c| format!(" (renamed from {})", c.original))
                .unwrap_or_default();
            let size = std::fs::metadata(&outcome.path).map(|m| m.len()).unwrap_or(0);
            println!(
                "  {} - {} of content, {} on disk{}{}",
                outcome.filename,
                format_bytes(outcome.bytes_copied),
                format_bytes(size),
                if outcome.verified { ", verified" } else { "" },
                renamed
            );
        }
        if let Some(descriptor) = &result.descriptor {
            println!("Descriptor:     {}", descriptor.display());
        }
    }

    Ok(())
}

fn print_summary(info: &VmInfo) {
    println!("VM Export");
    println!("---------");
    println!("Name:      {}", info.name);
    println!("UUID:      {}", info.uuid);
    println!("State:     {}", info.power_state);
    println!("CPUs:      {}", info.cpus);
    println!("Memory:    {} MB", info.memory_mb);
    println!("Disks:     {}", info.disks.len());
    println!("Total:     {}", format_bytes(info.total_disk_size));
}

fn show_info(inventory: &Path, identifier: &str) -> Result<()> {
    let backend = LocalBackend::load(inventory)
        .with_context(|| format!("failed to load backend '{}'", inventory.display()))?;
    let vm_info = get_vm_info(&backend, identifier)?;

    println!("VM Information");
    println!("==============");
    println!();
    println!("Name:       {}", vm_info.name);
    println!("UUID:       {}", vm_info.uuid);
    println!("State:      {}", vm_info.power_state);
    println!("CPUs:       {}", vm_info.cpus);
    println!("Memory:     {} MB", vm_info.memory_mb);
    println!("CD drives:  {}", vm_info.cdrom_count);
    println!("Interfaces: {}", vm_info.interface_count);
    println!();

    if vm_info.disks.is_empty() {
        println!("Disks:     None");
    } else {
        println!("Disks:");
        for (i, disk) in vm_info.disks.iter().enumerate() {
            println!(
                "  {}. {} [{}] - {} ({} allocated, device {}{})",
                i + 1,
                disk.label,
                disk.uuid,
                format_bytes(disk.size_bytes),
                format_bytes(disk.physical_bytes),
                disk.user_device,
                if disk.bootable { ", bootable" } else { "" }
            );
        }
        println!();
        println!("Total disk size: {}", format_bytes(vm_info.total_disk_size));
    }

    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_cli_parses_repeated_vms() {
        let cli = Cli::try_parse_from([
            "ovfexport", "export", "--inventory", "/srv/pool", "--vm", "web", "--vm", "db",
            "--verify", "--no-save",
        ])
        .unwrap();
        match cli.command {
            Commands::Export {
                vms, verify, no_save, ..
            } => {
                assert_eq!(vms, vec!["web", "db"]);
                assert!(verify);
                assert!(no_save);
            }
            Commands::Info { .. } => panic!("expected export command"),
        }
    }
}
