mod logging;
mod report;

use anyhow::{Context, Result, anyhow, bail};
use blkdup_core::hash::{DigestSource, Sha256Hasher};
use blkdup_core::platform;
use blkdup_core::verify::VerifySide;
use blkdup_core::{
    CancelToken, Device, DeviceRef, Digest, DigestSpec, Direction, Disposition, DupConfig,
    DuplicationWorkflow, ImageRef, Phase, WorkflowEvent, WorkflowOutcome, WorkflowRequest,
};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use logging::LogConfig;
use report::{DigestReport, RunReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use tracing::{debug, info};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Parser)]
#[command(name = "blkdup")]
#[command(about = "Verified raw capture and restore of block devices", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./blkdup.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a whole device into a raw image file
    #[command(allow_missing_positional = true)]
    Capture {
        /// Source device (e.g. sdb, /dev/sdb, disk2); prompts when omitted
        device: Option<String>,

        /// Output image file
        image: PathBuf,

        #[command(flatten)]
        options: RunOptions,
    },
    /// Restore a raw image file onto a whole device
    Restore {
        /// Image file to restore
        image: PathBuf,

        /// Target device (e.g. sdb, /dev/sdb, disk2); prompts when omitted
        device: Option<String>,

        #[command(flatten)]
        options: RunOptions,
    },
    /// List available devices
    List {
        /// Include fixed (non-removable) disks
        #[arg(short, long)]
        all: bool,
    },
    /// Print the SHA-256 digest of an image file or a device
    Hash {
        /// File or device to hash
        path: PathBuf,

        /// Treat PATH as a raw device
        #[arg(short, long)]
        device: bool,

        /// Print the digest as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunOptions {
    /// Skip verification after the copy
    #[arg(short = 'n', long = "no-verify")]
    no_verify: bool,

    /// Copy block size in bytes; K and M suffixes are accepted (e.g. 4M)
    #[arg(short, long, value_parser = parse_block_size)]
    block_size: Option<usize>,

    /// Continue even if the device cannot be unmounted
    #[arg(short, long)]
    force: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Leave the device unmounted when done
    #[arg(long)]
    no_remount: bool,

    /// Verify against this recorded SHA-256 of the source instead of hashing it
    #[arg(long, value_name = "HEX")]
    expect_digest: Option<String>,

    /// Print a JSON report instead of progress bars
    #[arg(long)]
    json: bool,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bars intact when the user cancels.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|()| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

/// Parses a byte count with an optional `K` or `M` suffix.
fn parse_block_size(value: &str) -> std::result::Result<usize, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1024),
        Some((i, 'm' | 'M')) => (&value[..i], 1024 * 1024),
        _ => (value, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("'{value}' is not a byte size"))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("'{value}' is too large"))
}

/// Layers the command-line flags over the file and environment settings.
fn load_config(path: Option<&Path>, options: &RunOptions) -> Result<DupConfig> {
    if let Some(path) = path {
        if !path.is_file() {
            bail!("configuration file {} does not exist", path.display());
        }
    }
    let mut config = DupConfig::load(path).context("failed to load configuration")?;
    if let Some(block_size) = options.block_size {
        config.block_size = block_size;
    }
    if options.no_verify {
        config.verify = false;
    }
    if options.no_remount {
        config.remount = false;
    }
    config.validate()?;
    debug!(?config, "Effective configuration");
    Ok(config)
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Asks the user to type `expected` back. Anything else declines.
fn confirm_typed(expected: &str) -> Result<bool> {
    let typed: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Type '{expected}' to confirm"))
        .allow_empty(true)
        .interact_text()?;

    Ok(typed.trim() == expected)
}

fn size_text(device: &DeviceRef) -> String {
    platform::device_size(device.raw_path()).map_or_else(
        || "unknown size".to_string(),
        |bytes| format!("{:.1} GB", bytes as f64 / GIB),
    )
}

/// Shows what is about to happen and asks for consent.
fn confirm_request(request: &WorkflowRequest) -> Result<bool> {
    let device = &request.device;
    match request.direction {
        Direction::Capture => {
            eprintln!("This will read all of '{}' ({}).", device, size_text(device));
            eprintln!("  Device: {}", style(device.node_path().display()).cyan());
            eprintln!("  Output: {}", style(request.image.path().display()).cyan());
            eprintln!();
            confirm_operation("Are you sure you want to proceed?")
        }
        Direction::Restore => {
            eprintln!(
                "{} This will erase all data on '{}' ({}).",
                style("WARNING:").red().bold(),
                device,
                size_text(device),
            );
            eprintln!("  Device: {}", style(device.node_path().display()).cyan());
            eprintln!("  Image:  {}", style(request.image.path().display()).cyan());
            eprintln!();
            confirm_typed(device.identifier())
        }
    }
}

fn bar_style(color: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// A progress bar for `total` bytes, or a byte-counting spinner when the
/// total is unknown.
fn new_bar(prefix: &'static str, total: Option<u64>, color: &str) -> ProgressBar {
    let bar = match total {
        Some(len) => ProgressBar::new(len).with_style(bar_style(color)),
        None => ProgressBar::new_spinner().with_style(spinner_style()),
    };
    bar.set_prefix(prefix);
    bar
}

/// Renders workflow events as one progress bar per copy or hashing pass.
struct ProgressUi {
    direction: Direction,
    quiet: bool,
    bar: Option<ProgressBar>,
    side: Option<VerifySide>,
    verify_total: Option<u64>,
}

impl ProgressUi {
    fn new(direction: Direction, quiet: bool) -> Self {
        Self {
            direction,
            quiet,
            bar: None,
            side: None,
            verify_total: None,
        }
    }

    fn start(&mut self, prefix: &'static str, total: Option<u64>, color: &str) {
        self.bar = Some(if self.quiet {
            ProgressBar::hidden()
        } else {
            new_bar(prefix, total, color)
        });
    }

    fn finish_current(&mut self, message: &'static str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(message);
        }
    }

    fn set_position(&self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(bytes);
        }
    }

    fn handle(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::PhaseStarted {
                phase: Phase::Copying,
                total_bytes,
            } => {
                let prefix = match self.direction {
                    Direction::Capture => "Capturing",
                    Direction::Restore => "Restoring",
                };
                self.start(prefix, total_bytes, "green");
            }
            WorkflowEvent::PhaseStarted {
                phase: Phase::Verifying,
                total_bytes,
            } => {
                self.finish_current("Copy complete.");
                self.verify_total = total_bytes;
            }
            WorkflowEvent::PhaseStarted { phase, .. } => debug!(%phase, "Phase started"),
            WorkflowEvent::CopyProgress { bytes } => self.set_position(bytes),
            WorkflowEvent::VerifyProgress { side, bytes } => {
                if self.side != Some(side) {
                    self.finish_current("Hashed.");
                    let prefix = match side {
                        VerifySide::Source => "Verify src",
                        VerifySide::Destination => "Verify dst",
                    };
                    self.start(prefix, self.verify_total, "magenta");
                    self.side = Some(side);
                }
                self.set_position(bytes);
            }
            WorkflowEvent::Warning(message) => {
                if self.quiet {
                    return;
                }
                let line = format!("{} {message}", style("warning:").yellow().bold());
                match &self.bar {
                    Some(bar) => bar.println(line),
                    None => eprintln!("{line}"),
                }
            }
        }
    }

    fn finish(mut self, outcome: &WorkflowOutcome) {
        match outcome.disposition() {
            Disposition::Success => self.finish_current("Done."),
            Disposition::Cancelled => self.finish_current("Cancelled."),
            Disposition::Failed | Disposition::Indeterminate => {
                self.finish_current("❌ Operation failed.")
            }
        }
    }
}

/// Runs the workflow on a worker thread while this thread draws progress.
fn execute(
    workflow: &DuplicationWorkflow,
    request: &WorkflowRequest,
    quiet: bool,
) -> Result<WorkflowOutcome> {
    let mut ui = ProgressUi::new(request.direction, quiet);
    let (tx, rx) = mpsc::channel();

    let outcome = std::thread::scope(|scope| {
        let worker = scope.spawn(move || {
            workflow.run(request, move |event| {
                // The receiver only goes away if the UI thread is gone too.
                let _ = tx.send(event);
            })
        });
        for event in rx {
            ui.handle(event);
        }
        worker.join()
    })
    .map_err(|_| anyhow!("the imaging thread panicked"))?;

    ui.finish(&outcome);
    Ok(outcome)
}

fn print_summary(request: &WorkflowRequest, outcome: &WorkflowOutcome) {
    let device = style(request.device.node_path().display()).cyan();
    let image = style(request.image.path().display()).cyan();
    let cause = outcome
        .cause()
        .map_or_else(|| "Operation failed.".to_string(), |e| e.to_string());

    match outcome.disposition() {
        Disposition::Success => {
            let action = match request.direction {
                Direction::Capture => format!("captured {device} to {image}"),
                Direction::Restore => format!("restored {image} to {device}"),
            };
            println!("\n✨ Successfully {action}.");
            match outcome.verification() {
                Some(verdict) => println!("  SHA-256: {}", verdict.source()),
                None => println!("  (verification skipped)"),
            }
        }
        Disposition::Indeterminate => {
            eprintln!(
                "\n{} The copy finished but could not be verified.",
                style("UNVERIFIED:").yellow().bold()
            );
            eprintln!("  {cause}");
        }
        Disposition::Failed => {
            eprintln!("\n❌ {cause}");
            if outcome.recommend_recopy() {
                eprintln!("  {device} does not match {image}. Run the restore again.");
            }
        }
        Disposition::Cancelled => {
            eprintln!(
                "\nOperation cancelled after {} bytes.",
                outcome.bytes_transferred()
            );
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Whether a failed run stopped on mounted volumes that `--force` could
/// override. A device locked by another run stays unavailable either way.
fn offers_force_override(outcome: &WorkflowOutcome) -> bool {
    outcome.phase() == Phase::GateCheck
        && outcome
            .cause()
            .is_some_and(|e| e.is_device_busy() && !e.is_device_locked())
}

fn run_duplication(
    direction: Direction,
    device: Option<String>,
    image: PathBuf,
    options: &RunOptions,
    config_path: Option<&Path>,
    cancel: CancelToken,
) -> Result<ExitCode> {
    let config = load_config(config_path, options)?;

    let device = match device {
        Some(identifier) => DeviceRef::parse(&identifier)?,
        None => {
            let devices = platform::list_devices(false).context("failed to list devices")?;
            let prompt = match direction {
                Direction::Capture => "Select the source device to CAPTURE from",
                Direction::Restore => "Select the target device to RESTORE to",
            };
            let selected = select_device(&devices, prompt)?;
            DeviceRef::parse(&selected.path.to_string_lossy())?
        }
    };

    let image = ImageRef::new(image);
    let mut request = match direction {
        Direction::Capture => WorkflowRequest::capture(device, image),
        Direction::Restore => WorkflowRequest::restore(image, device),
    }
    .with_verify(config.verify)
    .with_force(options.force)
    .with_remount(config.remount);
    if let Some(hex) = &options.expect_digest {
        request = request.with_expected_digest(Digest::from_hex(hex, "--expect-digest")?);
    }

    if !options.yes && !confirm_request(&request)? {
        eprintln!("{direction} cancelled.");
        return Ok(ExitCode::SUCCESS);
    }
    if cancel.is_cancelled() {
        eprintln!("Operation cancelled.");
        return Ok(exit_code(130));
    }
    eprintln!();

    info!(%direction, device = %request.device, image = %request.image.path().display(), "Starting");
    let workflow = DuplicationWorkflow::new(config, cancel);
    let mut outcome = execute(&workflow, &request, options.json)?;

    if offers_force_override(&outcome) && !request.force && !options.yes {
        if let Some(cause) = outcome.cause() {
            eprintln!("{} {cause}", style("Device busy:").yellow().bold());
        }
        if confirm_operation("Continue anyway? Raw I/O on a mounted device can corrupt it")? {
            request = request.with_force(true);
            outcome = execute(&workflow, &request, options.json)?;
        }
    }

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&RunReport::new(&request, &outcome))?
        );
    } else {
        print_summary(&request, &outcome);
    }
    Ok(exit_code(outcome.exit_code()))
}

fn list(all: bool) -> Result<()> {
    let devices = platform::list_devices(all).context("failed to list devices")?;
    let kind = if all { "block" } else { "removable" };
    if devices.is_empty() {
        println!("No {kind} devices found.");
        return Ok(());
    }

    println!("Found {} {kind} devices:", devices.len());
    println!(
        "\n  {:<14} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<14} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = if device.mount_points.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:<14} {:<25} {:>7.1} GB  {}",
            device.path.display(),
            device.description,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn hash(path: &Path, device: bool, json: bool, cancel: &CancelToken) -> Result<ExitCode> {
    let spec = if device {
        DigestSpec::device(path)
    } else {
        DigestSpec::file(path)
    };
    let bar = if json {
        ProgressBar::hidden()
    } else {
        new_bar("Hashing", platform::device_size(path), "magenta")
    };

    match Sha256Hasher.compute_digest(&spec, cancel, &mut |bytes| bar.set_position(bytes)) {
        Ok(digest) => {
            bar.finish_and_clear();
            if json {
                let report = DigestReport {
                    path,
                    kind: if device { "device" } else { "file" },
                    sha256: digest.to_hex(),
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{digest}  {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_cancelled() => {
            bar.abandon_with_message("Cancelled.");
            Ok(exit_code(130))
        }
        Err(e) => {
            bar.finish_and_clear();
            Err(e.into())
        }
    }
}

fn main() -> Result<ExitCode> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.log_json,
        verbose: cli.verbose,
    });

    // Ctrl+C only raises the flag; copy and hashing loops stop at the next block.
    let cancel = CancelToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || token.cancel())?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Capture {
            device,
            image,
            options,
        } => run_duplication(
            Direction::Capture,
            device,
            image,
            &options,
            config_path,
            cancel,
        ),
        Commands::Restore {
            image,
            device,
            options,
        } => run_duplication(
            Direction::Restore,
            device,
            image,
            &options,
            config_path,
            cancel,
        ),
        Commands::List { all } => {
            list(all)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Hash { path, device, json } => hash(&path, device, json, &cancel),
    }
}
