//! memmirror CLI - capture a process's memory and reconstruct its modules.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[cfg(target_os = "windows")]
use memmirror::{CaptureConfig, CaptureSession, ProgressInfo, ProgressStage};

#[cfg(target_os = "windows")]
use indicatif::{ProgressBar, ProgressStyle};

/// Process memory capture and PE reconstruction.
#[derive(Parser)]
#[command(name = "memmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture every committed region of a process into per-chunk dump files
    Dump {
        /// Target process id
        #[arg(short, long)]
        pid: u32,

        /// Output directory for the .dmp files
        #[arg(short, long)]
        output: PathBuf,

        /// Module name whose dump should get its PE headers realigned
        /// after capture (e.g. "game.exe")
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Capture each heap block of a process as its own dump file
    Heaps {
        /// Target process id
        #[arg(short, long)]
        pid: u32,

        /// Output directory for the .dmp files
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List the modules loaded in a process
    Modules {
        /// Target process id
        #[arg(short, long)]
        pid: u32,
    },

    /// List the committed memory regions of a process
    Regions {
        /// Target process id
        #[arg(short, long)]
        pid: u32,
    },
}

#[cfg(target_os = "windows")]
fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump {
            pid,
            output,
            module,
        } => dump(pid, &output, module.as_deref())?,
        Commands::Heaps { pid, output } => heaps(pid, &output)?,
        Commands::Modules { pid } => list_modules(pid)?,
        Commands::Regions { pid } => list_regions(pid)?,
    }

    Ok(())
}

#[cfg(target_os = "windows")]
fn open_target(pid: u32) -> anyhow::Result<memmirror::process::WindowsProcess> {
    use memmirror::process::WindowsProcess;
    Ok(WindowsProcess::open(pid)?)
}

#[cfg(target_os = "windows")]
fn progress_bar() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

#[cfg(target_os = "windows")]
fn dump(pid: u32, output: &PathBuf, module: Option<&str>) -> anyhow::Result<()> {
    use bytesize::ByteSize;

    println!("Capturing pid {} into {}", pid, output.display());

    let process = open_target(pid)?;
    let pb = progress_bar()?;
    let pb_clone = pb.clone();

    let mut config = CaptureConfig::new(output);
    config.progress_callback = Some(Box::new(move |info: &ProgressInfo| {
        pb_clone.set_length(info.total.max(1) as u64);
        pb_clone.set_position(info.current as u64);

        let msg = match info.stage {
            ProgressStage::WritingChunks => {
                let item = info.current_item.as_deref().unwrap_or("");
                format!(
                    "{} - {} ({})",
                    info.stage.name(),
                    item,
                    ByteSize::b(info.bytes_written)
                )
            }
            _ => info.stage.name().to_string(),
        };
        pb_clone.set_message(msg);
    }));

    let session = CaptureSession::new(&process, config);
    let summary = session.capture_chunks()?;
    pb.finish_with_message("Complete");
    println!(
        "\nWrote {} chunks, {} total",
        summary.chunks,
        ByteSize::b(summary.bytes)
    );

    if let Some(name) = module {
        let info = session.find_module(name)?;
        let target = session.module_target(&info)?;
        let dump_path = summary
            .files
            .iter()
            .find(|p| {
                p.file_name()
                    .map(|f| {
                        f.to_string_lossy()
                            .starts_with(&format!("{:X}-", info.address))
                    })
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow::anyhow!("no chunk was written for module {name}"))?;

        let report = session.rebuild_module(&target, dump_path)?;
        println!(
            "Realigned {}: {} sections, SizeOfImage {}, overlay {}",
            dump_path.display(),
            report.sections,
            ByteSize::b(report.size_of_image as u64),
            ByteSize::b(report.overlay_bytes)
        );
    }

    Ok(())
}

#[cfg(target_os = "windows")]
fn heaps(pid: u32, output: &PathBuf) -> anyhow::Result<()> {
    use bytesize::ByteSize;

    println!("Capturing heaps of pid {} into {}", pid, output.display());

    let process = open_target(pid)?;
    let session = CaptureSession::new(&process, CaptureConfig::new(output));
    let summary = session.capture_heaps()?;

    println!(
        "Wrote {} heap blocks, {} total",
        summary.chunks,
        ByteSize::b(summary.bytes)
    );
    Ok(())
}

#[cfg(target_os = "windows")]
fn list_modules(pid: u32) -> anyhow::Result<()> {
    use bytesize::ByteSize;
    use memmirror::process::SnapshotSource;

    let process = open_target(pid)?;
    let modules = process.modules()?;

    println!("Loaded modules ({}):", modules.len());
    println!("{:<20} {:<12} Name", "Base", "Size");
    for module in &modules {
        println!(
            "0x{:016X} {:>10}   {}",
            module.address,
            ByteSize::b(module.size),
            module.name
        );
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn list_regions(pid: u32) -> anyhow::Result<()> {
    use bytesize::ByteSize;
    use memmirror::committed_regions;

    let process = open_target(pid)?;
    let regions = committed_regions(&process)?;

    println!("Committed regions ({}):", regions.len());
    println!("{:<20} {:<12} {:<10} Kind", "Address", "Size", "Protect");
    for region in &regions {
        println!(
            "0x{:016X} {:>10}   {:#010x} {:?}",
            region.address,
            ByteSize::b(region.size),
            region.protect,
            region.kind
        );
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("memmirror is only supported on Windows");
    std::process::exit(1);
}
