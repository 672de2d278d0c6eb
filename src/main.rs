//! conterm - run a console program on a pseudo console
//!
//! Lines typed on stdin are sent to the hosted program, and everything it
//! prints is copied to stdout with escape sequences intact.
//!
//! # Quick Start
//!
//! ```text
//! conterm                    # cmd.exe (or the shell from config.toml)
//! conterm -s pwsh.exe -l     # PowerShell 7, print the cleaned transcript at exit
//! conterm --cols 120 --rows 40
//! ```

use std::env;
use std::io::{self, BufRead, Write};
use std::thread;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use conterm::{Config, ConsoleSize, SessionEvent, TerminalSession};

/// Command line options
#[derive(Debug, Default)]
struct Args {
    shell: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    log: bool,
    preview: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("conterm {}", VERSION);
}

fn print_help() {
    eprintln!("conterm {} - Host a console program on a pseudo console", VERSION);
    eprintln!();
    eprintln!("Usage: conterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Command line to run (default: config.toml or cmd.exe)");
    eprintln!("      --cols <N>        Console width (default: current terminal)");
    eprintln!("      --rows <N>        Console height (default: current terminal)");
    eprintln!("  -l, --log             Print the cleaned transcript on exit");
    eprintln!("      --preview         Do not launch anything, show placeholder output");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.conterm/config.toml");
    eprintln!("Log file:      ~/.conterm/conterm.log (level from RUST_LOG)");
    eprintln!();
    eprintln!("Exit: type 'exit' in the hosted shell");
}

fn parse_number(args: &[String], i: usize, name: &str) -> Result<u16, String> {
    let value = args
        .get(i)
        .ok_or_else(|| format!("Missing {} argument", name))?;
    match value.parse::<u16>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", name, value)),
    }
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                let shell = args.get(i).ok_or("Missing shell argument")?;
                parsed.shell = Some(shell.clone());
            }
            "--cols" => {
                i += 1;
                parsed.cols = Some(parse_number(&args, i, "--cols")?);
            }
            "--rows" => {
                i += 1;
                parsed.rows = Some(parse_number(&args, i, "--rows")?);
            }
            "-l" | "--log" => parsed.log = true,
            "--preview" => parsed.preview = true,
            other => return Err(format!("Unknown option: {}", other)),
        }
        i += 1;
    }

    Ok(parsed)
}

fn init_logging() {
    let log_path = Config::data_dir()
        .map(|dir| dir.join("conterm.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("conterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("conterm starting...");

    // command line overrides config.toml and the environment
    let mut config = Config::load();
    if let Some(shell) = args.shell {
        config.shell = shell;
    }
    if args.preview {
        config.preview = true;
    }
    config.log_output |= args.log;

    let (term_cols, term_rows) = crossterm::terminal::size().unwrap_or((config.columns, config.rows));
    let size = ConsoleSize::new(args.cols.unwrap_or(term_cols), args.rows.unwrap_or(term_rows));

    run(&config, size)
}

fn run(config: &Config, size: ConsoleSize) -> anyhow::Result<()> {
    let session = TerminalSession::new(config.session_options());
    let events = session.subscribe();

    let runner = session.clone();
    let command = config.shell.clone();
    let log_output = config.log_output;
    let handle = thread::Builder::new()
        .name("conterm-session".to_string())
        .spawn(move || runner.start(&command, size, log_output))
        .context("failed to spawn session thread")?;

    // stdin is never closed under us; the thread dies with the process
    let input = session.clone();
    thread::Builder::new()
        .name("conterm-stdin".to_string())
        .spawn(move || forward_stdin(&input))
        .context("failed to spawn stdin thread")?;

    let mut stdout = io::stdout();
    for event in &events {
        match event {
            SessionEvent::Ready => {
                info!(shell = %config.shell, cols = size.cols, rows = size.rows, "session ready");
                if config.preview {
                    session.start_read_loop();
                    break;
                }
            }
            SessionEvent::Output(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            SessionEvent::Exited(code) => {
                info!(?code, "session exited");
                break;
            }
        }
    }
    // preview output was published while the loop above was breaking out
    for event in events.try_iter() {
        if let SessionEvent::Output(text) = event {
            stdout.write_all(text.as_bytes())?;
        }
    }

    let exit_code = match handle.join() {
        Ok(result) => result.with_context(|| format!("failed to run {}", config.shell))?,
        Err(_) => anyhow::bail!("session thread panicked"),
    };

    if config.log_output {
        println!();
        println!("{}", session.console_text(true));
    }

    if let Some(code) = exit_code {
        if code != 0 {
            warn!(code, "shell exited with non-zero status");
        }
    }
    Ok(())
}

fn forward_stdin(session: &TerminalSession) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("failed to read stdin: {}", e);
                break;
            }
        };
        match session.write_str(&format!("{}\r", line)) {
            Ok(()) => {}
            Err(conterm::PtyError::NotConnected) => break,
            Err(e) => warn!("input dropped: {}", e),
        }
    }
    session.close_input();
}
