use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};

use clap::Parser;

use lvmsync::config::SyncConfig;
use lvmsync::device_locator::{self, ShellDmSource};
use lvmsync::error::ConfigError;
use lvmsync::{receiver, sender, Error, Result};

/// Transfer the chunks an LVM snapshot's origin has changed since the
/// snapshot was taken to a (usually remote) destination device.
///
/// With no mode flag, runs as the sender over the network: the snapshot's
/// changed chunks are read from its origin device and piped to a copy of
/// this binary running in `--server` mode on HOST, via a spawned `ssh`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Run as the receiver, reading the framed chunk stream from standard input.
    #[arg(long)]
    server: bool,

    /// Sender mode: write the framed stream to FILE instead of over the
    /// network. Use `-` to write to standard output.
    #[arg(short, long, value_name = "FILE")]
    patch: Option<PathBuf>,

    /// Receiver mode: apply a previously captured patch or snapback file to
    /// a destination device.
    #[arg(short, long, value_name = "FILE")]
    apply: Option<PathBuf>,

    /// Record a pre-image rollback file as records are applied. Valid with
    /// `--server`, `--apply`, or the default network sender (where it is
    /// passed through to the remote receiver).
    #[arg(short = 'b', long, value_name = "FILE")]
    snapback: Option<PathBuf>,

    /// Increase log verbosity. Repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress the final human-readable transfer summary.
    #[arg(short, long)]
    quiet: bool,

    /// Positional arguments; their meaning depends on the selected mode (see
    /// above). Default sender: `<snapshot> <host>:<destdev>`. `--patch`:
    /// `<snapshot>`. `--server`: `<destdev>`. `--apply`: `<destdev>`.
    #[arg(trailing_var_arg = true)]
    positional: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Sender, streaming to a remote `lvmsync --server` over a spawned shell.
    Network { snapshot: String, host: String, destdev: String },
    /// Sender, writing a framed stream to a local file (or stdout for `-`).
    Patch { snapshot: String, patch_path: PathBuf },
    /// Receiver, reading the framed stream from standard input.
    Server { destdev: PathBuf },
    /// Receiver, reading the framed stream from a local file.
    Apply { patch_path: PathBuf, destdev: PathBuf },
}

fn resolve_mode(cli: &Cli) -> Result<Mode> {
    if cli.server {
        let destdev = cli
            .positional
            .first()
            .cloned()
            .ok_or(ConfigError::MissingDestination)?;
        return Ok(Mode::Server { destdev: PathBuf::from(destdev) });
    }

    if let Some(patch_path) = &cli.apply {
        let destdev = cli
            .positional
            .first()
            .cloned()
            .ok_or(ConfigError::MissingDestination)?;
        return Ok(Mode::Apply { patch_path: patch_path.clone(), destdev: PathBuf::from(destdev) });
    }

    if let Some(patch_path) = &cli.patch {
        let snapshot = cli
            .positional
            .first()
            .cloned()
            .ok_or(ConfigError::MissingSnapshot)?;
        return Ok(Mode::Patch { snapshot, patch_path: patch_path.clone() });
    }

    let snapshot = cli.positional.first().cloned().ok_or(ConfigError::MissingSnapshot)?;
    let target = cli.positional.get(1).ok_or(ConfigError::MissingDestination)?;
    let (host, destdev) = target
        .split_once(':')
        .ok_or_else(|| ConfigError::MalformedDeviceName(target.clone()))?;

    Ok(Mode::Network { snapshot, host: host.to_string(), destdev: destdev.to_string() })
}

fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig { snapback_path: cli.snapback.clone(), quiet: cli.quiet };
    let mode = resolve_mode(&cli)?;

    match mode {
        Mode::Network { snapshot, host, destdev } => run_network_sender(&snapshot, &host, &destdev, &config),
        Mode::Patch { snapshot, patch_path } => run_patch_sender(&snapshot, &patch_path, &config),
        Mode::Server { destdev } => run_server_receiver(&destdev, &config),
        Mode::Apply { patch_path, destdev } => run_apply_receiver(&patch_path, &destdev, &config),
    }
}

fn resolved_devices(snapshot: &str) -> Result<(PathBuf, PathBuf)> {
    let resolved = device_locator::locate(&ShellDmSource, snapshot)?;
    tracing::debug!(
        snapshot,
        origin_dm = %resolved.origin_dm,
        exception_dm = %resolved.exception_dm,
        "resolved snapshot devices"
    );
    Ok((
        PathBuf::from(format!("/dev/mapper/{}", resolved.origin_dm)),
        PathBuf::from(format!("/dev/mapper/{}", resolved.exception_dm)),
    ))
}

fn run_patch_sender(snapshot: &str, patch_path: &std::path::Path, config: &SyncConfig) -> Result<()> {
    let (origin_path, exception_path) = resolved_devices(snapshot)?;

    if patch_path.as_os_str() == "-" {
        let mut out = io::stdout().lock();
        let summary = sender::send_from_paths(&exception_path, &origin_path, &mut out)?;
        if !config.quiet {
            eprintln!("{}", sender::format_summary(&summary));
        }
    } else {
        let mut out = std::fs::File::create(patch_path).map_err(|source| Error::io(patch_path, source))?;
        let summary = sender::send_from_paths(&exception_path, &origin_path, &mut out)?;
        if !config.quiet {
            eprintln!("{}", sender::format_summary(&summary));
        }
    }
    Ok(())
}

fn run_network_sender(snapshot: &str, host: &str, destdev: &str, config: &SyncConfig) -> Result<()> {
    let (origin_path, exception_path) = resolved_devices(snapshot)?;

    // `--server`'s destdev is a positional slurped by `trailing_var_arg`, so
    // any flags (like `--snapback`) must come before it on the remote
    // command line or they'd be swallowed into `positional` too.
    let mut remote_command = String::from("lvmsync --server");
    if let Some(snapback_path) = &config.snapback_path {
        remote_command.push_str(" --snapback ");
        remote_command.push_str(&snapback_path.to_string_lossy());
    }
    remote_command.push(' ');
    remote_command.push_str(destdev);

    tracing::info!(host, %remote_command, "spawning remote receiver");
    let mut child = Command::new("ssh")
        .arg(host)
        .arg(remote_command)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(Error::UnpathedIo)?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let summary = sender::send_from_paths(&exception_path, &origin_path, &mut stdin)?;
    drop(stdin);

    let status = child.wait().map_err(Error::UnpathedIo)?;
    if !status.success() {
        tracing::warn!(?status, "remote receiver exited with a non-zero status");
    }

    if !config.quiet {
        eprintln!("{}", sender::format_summary(&summary));
    }
    Ok(())
}

fn run_server_receiver(destdev: &std::path::Path, config: &SyncConfig) -> Result<()> {
    let stdin = io::stdin();
    let mut input = BufReader::new(stdin.lock());
    let summary = receiver::receive_to_path(&mut input, destdev, config.snapback_path.as_deref())?;
    if !config.quiet {
        eprintln!("{}", receiver::format_summary(&summary));
    }
    Ok(())
}

fn run_apply_receiver(patch_path: &std::path::Path, destdev: &std::path::Path, config: &SyncConfig) -> Result<()> {
    let mut input = if patch_path.as_os_str() == "-" {
        receiver::buffered(Box::new(io::stdin()) as Box<dyn std::io::Read>)
    } else {
        let file = std::fs::File::open(patch_path).map_err(|source| Error::io(patch_path, source))?;
        receiver::buffered(Box::new(file) as Box<dyn std::io::Read>)
    };
    let summary = receiver::receive_to_path(&mut input, destdev, config.snapback_path.as_deref())?;
    if !config.quiet {
        eprintln!("{}", receiver::format_summary(&summary));
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lvmsync: {err}");
            ExitCode::FAILURE
        }
    }
}
