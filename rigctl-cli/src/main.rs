//! rigctl CLI - drive the Master/Target pin test rig from a terminal.
//!
//! ## Features
//!
//! - Run the three-stage pin test and report problem pins
//! - Flash the Target through its DFU bootloader and rebind its new port
//! - Flash then test in one step, starting once the Target reports in
//! - Interactive console for repeated runs
//! - Interactive or remembered port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::{debug, warn};
use rigctl::flash::nrfutil::Launcher;
use rigctl::{
    Backend, Control, ControlState, Controller, ControllerConfig, NativePortEnumerator, Nrfutil, PortEnumerator,
    Role, SelectionStore, SessionState, UiEvent, selection_key,
};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

mod config;
mod render;
mod serial;

use config::{Config, PortStore};
use render::{Renderer, format_pins};
use serial::{PortSources, select_role_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Event loop poll step.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// CLI failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or invalid input; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// The rig reported a failure; exit code 1.
    #[error("{0}")]
    TestFailed(String),
    /// Interrupted by the operator; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::TestFailed(_) => 1,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error returned from a command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>().map_or(1, CliError::exit_code)
}

/// rigctl - controller for a Master/Target pin test rig.
///
/// Environment variables:
///   RIGCTL_MASTER           - Master serial port
///   RIGCTL_TARGET           - Target serial port
///   RIGCTL_BAUD             - Baud rate (default: 115200)
///   RIGCTL_FIRMWARE         - Target firmware image (Intel HEX)
///   RIGCTL_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "rigctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Master serial port.
    #[arg(short, long, global = true, env = "RIGCTL_MASTER")]
    master: Option<String>,

    /// Target serial port.
    #[arg(short, long, global = true, env = "RIGCTL_TARGET")]
    target: Option<String>,

    /// Baud rate of both links and the firmware upload [default: 115200].
    #[arg(short, long, global = true, env = "RIGCTL_BAUD")]
    baud: Option<u32>,

    /// Target firmware image (Intel HEX).
    #[arg(long, global = true, env = "RIGCTL_FIRMWARE", value_name = "PATH")]
    firmware: Option<PathBuf>,

    /// Seconds to wait for each port change while flashing [default: 12].
    #[arg(long, global = true, value_name = "SECS")]
    phase_timeout: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "RIGCTL_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run the pin test.
    Test {
        /// Give up after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Flash the Target firmware.
    Flash,

    /// Flash the Target, then run the test once it reports in.
    FlashRun {
        /// Give up after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Interactive console reading commands from stdin.
    Console,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "rigctl v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    rigctl::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::ListPorts { json } => {
            cmd_list_ports(&NativePortEnumerator, *json);
            Ok(())
        },
        Commands::Test { timeout } => cmd_test(cli, &config, *timeout),
        Commands::Flash => cmd_flash(cli, &config),
        Commands::FlashRun { timeout } => cmd_flash_run(cli, &config, *timeout),
        Commands::Console => cmd_console(cli, &config),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Controller settings from arguments and configuration.
fn controller_config(cli: &Cli, config: &Config) -> ControllerConfig {
    let mut settings = ControllerConfig {
        baud_rate: cli.baud.or(config.ports.baud).unwrap_or(115200),
        firmware: cli.firmware.clone().or_else(|| config.flash.firmware.clone()),
        ..Default::default()
    };
    if let Some(secs) = cli.phase_timeout.or(config.flash.phase_timeout_secs) {
        settings.phase_timeout = Duration::from_secs(secs);
    }
    settings
}

/// Native backend with the configured flashing tool.
fn backend(config: &Config) -> Backend {
    let mut backend = Backend::native();
    let mut tool = Nrfutil::new(Arc::clone(&backend.enumerator));
    if let Some(path) = &config.flash.tool {
        tool = tool.with_launcher(Launcher::program(path));
    }
    if let Some(dev_type) = &config.flash.dev_type {
        tool = tool.with_dev_type(dev_type);
    }
    backend.tool = Arc::new(tool);
    backend
}

/// Fail early when no firmware image is configured.
fn require_firmware(settings: &ControllerConfig) -> Result<()> {
    match &settings.firmware {
        Some(path) if path.is_file() => Ok(()),
        Some(path) => Err(CliError::Usage(format!("Firmware file not found: {}", path.display())).into()),
        None => Err(CliError::Usage(
            "No firmware image configured; pass --firmware or set [flash] firmware".to_string(),
        )
        .into()),
    }
}

/// Resolve both ports, bind the links and return the controller.
fn open_rig(cli: &Cli, config: &Config, settings: ControllerConfig) -> Result<(Controller, Receiver<UiEvent>)> {
    let backend = backend(config);
    let store = PortStore::open_default();
    debug!("Port selections stored in {}", store.path().display());

    let mut ports = Vec::with_capacity(2);
    for role in Role::ALL {
        let remembered = store.get(selection_key(role));
        let sources = PortSources {
            cli: match role {
                Role::Master => cli.master.as_deref(),
                Role::Target => cli.target.as_deref(),
            },
            config: match role {
                Role::Master => config.ports.master.as_deref(),
                Role::Target => config.ports.target.as_deref(),
            },
            remembered: remembered.as_deref(),
        };
        ports.push(select_role_port(
            role,
            &sources,
            cli.non_interactive,
            backend.enumerator.as_ref(),
        )?);
    }

    if !cli.quiet {
        eprintln!(
            "{} Master {} / Target {} @ {}",
            style("🔌").cyan(),
            style(&ports[0]).green(),
            style(&ports[1]).green(),
            settings.baud_rate
        );
    }

    let (tx, rx) = mpsc::channel();
    let mut controller = Controller::new(settings, backend, Box::new(store), tx);
    for (role, port) in Role::ALL.into_iter().zip(ports) {
        controller.set_selection(role, port);
    }
    controller
        .restart_readers()
        .context("Failed to start serial links")?;
    Ok((controller, rx))
}

/// What an event loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    /// Session reaches SUCCESS or FAILURE.
    TestResult,
    /// Flash job reports success or error.
    FlashResult,
}

/// Pump events until `goal` is met, the deadline passes, or Ctrl-C.
fn drive(
    controller: &mut Controller,
    rx: &Receiver<UiEvent>,
    renderer: &mut Renderer,
    goal: Goal,
    timeout: Option<Duration>,
) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if was_interrupted() {
            controller.cancel_flash();
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        }

        controller.pump(PUMP_INTERVAL);
        for event in rx.try_iter() {
            renderer.handle(&event);
            // Stage errors during flash-run also mark FlashAndRun; only the
            // Flash control reports the flash job itself.
            if event == UiEvent::control(Control::Flash, ControlState::Error) {
                return Err(CliError::TestFailed("Flash failed".to_string()).into());
            }
            if goal == Goal::FlashResult
                && event == UiEvent::control(Control::Flash, ControlState::Success)
            {
                return Ok(());
            }
        }

        if goal == Goal::TestResult {
            let session = controller.session();
            match session.state() {
                SessionState::Success => return Ok(()),
                SessionState::Failure => {
                    let pins = session.problem_pins();
                    let detail = if pins.is_empty() {
                        String::new()
                    } else {
                        format!(" (problem pins: {})", format_pins(pins))
                    };
                    return Err(CliError::TestFailed(format!("Test failed{detail}")).into());
                },
                SessionState::Idle | SessionState::Testing => {},
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CliError::TestFailed("Timed out waiting for the rig".to_string()).into());
        }
    }
}

/// Run `body` against a freshly opened rig and always shut it down.
fn with_rig<F>(cli: &Cli, config: &Config, settings: ControllerConfig, body: F) -> Result<()>
where
    F: FnOnce(&mut Controller, &Receiver<UiEvent>, &mut Renderer) -> Result<()>,
{
    let (mut controller, rx) = open_rig(cli, config, settings)?;
    let mut renderer = Renderer::new(cli.quiet, use_fancy_output());
    let result = body(&mut controller, &rx, &mut renderer);
    renderer.finish();
    for name in controller.shutdown() {
        warn!("{name} did not stop in time");
    }
    result
}

/// Test command implementation.
fn cmd_test(cli: &Cli, config: &Config, timeout: Option<u64>) -> Result<()> {
    let settings = controller_config(cli, config);
    with_rig(cli, config, settings, |controller, rx, renderer| {
        controller.start_test().context("Failed to start the test")?;
        drive(
            controller,
            rx,
            renderer,
            Goal::TestResult,
            timeout.map(Duration::from_secs),
        )
    })
}

/// Flash command implementation.
fn cmd_flash(cli: &Cli, config: &Config) -> Result<()> {
    let settings = controller_config(cli, config);
    require_firmware(&settings)?;
    with_rig(cli, config, settings, |controller, rx, renderer| {
        controller.start_flash().context("Failed to start flashing")?;
        drive(controller, rx, renderer, Goal::FlashResult, None)?;
        if !cli.quiet {
            if let Some(port) = controller.selection(Role::Target) {
                eprintln!("{} Target on {}", style("→").green().bold(), style(port).cyan());
            }
        }
        Ok(())
    })
}

/// Flash-then-test command implementation.
fn cmd_flash_run(cli: &Cli, config: &Config, timeout: Option<u64>) -> Result<()> {
    let settings = controller_config(cli, config);
    require_firmware(&settings)?;
    with_rig(cli, config, settings, |controller, rx, renderer| {
        controller
            .start_flash_and_run()
            .context("Failed to start flashing")?;
        drive(
            controller,
            rx,
            renderer,
            Goal::TestResult,
            timeout.map(Duration::from_secs),
        )
    })
}

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleCommand {
    Test,
    Flash,
    FlashRun,
    Cancel,
    Select(Role, String),
    Status,
    Help,
    Quit,
}

/// Parse one console line. Empty lines yield `None`.
fn parse_console_command(line: &str) -> Option<std::result::Result<ConsoleCommand, String>> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let rest = words.collect::<Vec<_>>().join(" ");
    let command = match (verb.to_ascii_lowercase().as_str(), rest.is_empty()) {
        ("test" | "run", true) => ConsoleCommand::Test,
        ("flash", true) => ConsoleCommand::Flash,
        ("flash-run", true) => ConsoleCommand::FlashRun,
        ("cancel", true) => ConsoleCommand::Cancel,
        ("status", true) => ConsoleCommand::Status,
        ("help" | "?", true) => ConsoleCommand::Help,
        ("quit" | "exit", true) => ConsoleCommand::Quit,
        ("master", false) => ConsoleCommand::Select(Role::Master, rest),
        ("target", false) => ConsoleCommand::Select(Role::Target, rest),
        _ => return Some(Err(format!("Unknown command: {}", line.trim()))),
    };
    Some(Ok(command))
}

const CONSOLE_HELP: &str =
    "Commands: test, flash, flash-run, cancel, master <port>, target <port>, status, quit";

/// Print controller status to stdout.
fn print_status(controller: &Controller) {
    for role in Role::ALL {
        let link = controller.link(role);
        println!(
            "{role}: {} ({}{})",
            controller.selection(role).unwrap_or("-"),
            if link.is_some_and(rigctl::SerialLink::is_connected) {
                "connected"
            } else {
                "disconnected"
            },
            if controller.session().is_ready(role) { ", ready" } else { "" },
        );
    }
    let session = controller.session();
    println!(
        "session: {:?}, last action: {:?}, flashing: {}",
        session.state(),
        session.last_action(),
        controller.is_flashing()
    );
    if !session.problem_pins().is_empty() {
        println!("problem pins: {}", format_pins(session.problem_pins()));
    }
}

/// Console command implementation.
fn cmd_console(cli: &Cli, config: &Config) -> Result<()> {
    let settings = controller_config(cli, config);
    with_rig(cli, config, settings, |controller, rx, renderer| {
        let (line_tx, line_rx) = mpsc::channel::<String>();
        std::thread::Builder::new()
            .name("rigctl-stdin".to_string())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("Failed to read stdin")?;

        if !cli.quiet {
            eprintln!("{}", style(CONSOLE_HELP).dim());
        }

        loop {
            if was_interrupted() {
                controller.cancel_flash();
                return Ok(());
            }

            controller.pump(PUMP_INTERVAL);
            for event in rx.try_iter() {
                renderer.handle(&event);
            }

            let line = match line_rx.try_recv() {
                Ok(line) => line,
                Err(mpsc::TryRecvError::Empty) => continue,
                Err(mpsc::TryRecvError::Disconnected) => return Ok(()),
            };
            let command = match parse_console_command(&line) {
                None => continue,
                Some(Ok(command)) => command,
                Some(Err(message)) => {
                    eprintln!("{} {message}. {CONSOLE_HELP}", style("?").yellow());
                    continue;
                },
            };

            let result = match command {
                ConsoleCommand::Test => controller.start_test(),
                ConsoleCommand::Flash => controller.start_flash(),
                ConsoleCommand::FlashRun => controller.start_flash_and_run(),
                ConsoleCommand::Cancel => {
                    if !controller.cancel_flash() {
                        eprintln!("Nothing to cancel");
                    }
                    Ok(())
                },
                ConsoleCommand::Select(role, value) => match serial::normalize_device(role, &value) {
                    Ok(device) => controller.select_port(role, device),
                    Err(e) => {
                        eprintln!("{} {e}", style("?").yellow());
                        Ok(())
                    },
                },
                ConsoleCommand::Status => {
                    print_status(controller);
                    Ok(())
                },
                ConsoleCommand::Help => {
                    eprintln!("{CONSOLE_HELP}");
                    Ok(())
                },
                ConsoleCommand::Quit => return Ok(()),
            };
            if let Err(e) = result {
                eprintln!("{} {e}", style("Error:").red().bold());
            }
        }
    })
}

/// List ports command implementation.
fn cmd_list_ports(enumerator: &dyn PortEnumerator, json: bool) {
    let detected = rigctl::detect_ports(enumerator);

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.info.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.info.vid,
                    "pid": p.info.pid,
                    "manufacturer": p.info.manufacturer,
                    "product": p.info.product,
                    "serial": p.info.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("<no ports detected>").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.info.vid, port.info.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port.info.product.as_deref().unwrap_or("");

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(port.name()).cyan(),
            device_type,
            vid_pid,
            if !product.is_empty() {
                format!(" - {}", style(product).dim())
            } else {
                String::new()
            }
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
