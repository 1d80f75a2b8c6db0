use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labwired_ulp_config::HarnessConfig;
use labwired_ulp_core::session::{CommandSession, SessionConfig, BINARY_CAPACITY};
use labwired_ulp_core::{RtcSlowMemory, Supervisor, SupervisorConfig, SystemClock};
use labwired_ulp_emu::EmulatedCoprocessor;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

mod test_mode;

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "ESP32 ULP coprocessor test harness", long_about = None)]
struct Cli {
    /// Enable debug logging, including mailbox traffic
    #[arg(short, long, global = true)]
    trace: bool,

    /// Path to the harness config (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ULP image on the emulator and print what it reports
    Run {
        /// Path to the image (.bin, .b64 or ELF)
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Run a YAML test script and check its assertions
    Test {
        #[arg(short, long)]
        script: PathBuf,

        /// Directory for result.json
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Do not echo coprocessor output to stdout
        #[arg(long)]
        no_output_stdout: bool,
    },
    /// Serve the line protocol on stdin/stdout
    Serve,
}

type Harness = (
    Supervisor<RtcSlowMemory, SystemClock>,
    EmulatedCoprocessor<RtcSlowMemory>,
);

/// Wires a supervisor and an emulated ULP to one RTC slow memory.
fn build_harness(config: &HarnessConfig) -> Result<Harness> {
    let memory = RtcSlowMemory::default();
    let clock = SystemClock::new(Duration::from_millis(config.pause_ms));
    let supervisor = Supervisor::new(
        memory.clone(),
        clock,
        SupervisorConfig {
            timeout: Duration::from_millis(config.timeout_ms),
            load_addr: config.load_addr,
            entry_point: config.entry_point,
        },
    );
    let coprocessor = EmulatedCoprocessor::new(memory)
        .with_reserved_bytes(config.reserved_bytes()?)
        .with_max_cycles(config.max_cycles);
    Ok((supervisor, coprocessor))
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => {
            info!("Loading harness config: {:?}", path);
            HarnessConfig::from_file(path)
        }
        None => Ok(HarnessConfig::default()),
    }
}

fn run(config: &HarnessConfig, image: &Path) -> Result<()> {
    let binary = labwired_ulp_loader::load_image(image)?;
    let (mut supervisor, mut coprocessor) = build_harness(config)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let report = supervisor.supervise(&mut coprocessor, &binary, &mut out)?;
    writeln!(out)?;

    info!(
        "Outcome: {:?} ({} messages, {} ms)",
        report.outcome, report.messages, report.elapsed_ms
    );
    report.outcome.into_result()?;
    Ok(())
}

fn serve(config: &HarnessConfig) -> Result<()> {
    let (supervisor, coprocessor) = build_harness(config)?;
    let session_config = SessionConfig {
        command_capacity: config.command_capacity_bytes()?,
        binary_capacity: BINARY_CAPACITY,
    };
    let mut session = CommandSession::new(supervisor, coprocessor, session_config);
    info!("Serving on stdin/stdout");
    session
        .serve(std::io::stdin().lock(), std::io::stdout().lock())
        .context("Command session failed")?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the coprocessor output and the line protocol
    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting LabWired ULP harness");

    match cli.command {
        Command::Test {
            script,
            output_dir,
            no_output_stdout,
        } => ExitCode::from(test_mode::run_test(
            cli.config.as_deref(),
            &script,
            output_dir.as_deref(),
            no_output_stdout,
        )),
        Command::Run { image } => {
            finish(load_config(cli.config.as_deref()).and_then(|config| run(&config, &image)))
        }
        Command::Serve => {
            finish(load_config(cli.config.as_deref()).and_then(|config| serve(&config)))
        }
    }
}

fn finish(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::from(EXIT_PASS),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
