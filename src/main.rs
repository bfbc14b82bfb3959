//! ntty - POSIX terminals over a console
//!
//! Runs a console-backed pty master on the current console and a small
//! line-echo program on its slave, so the line discipline, the escape
//! engine and job-control signals can be tried by hand.
//!
//! # Quick Start
//!
//! ```text
//! ntty               # canonical mode, UTF-8
//! ntty --raw         # non-canonical: every key is shown as it arrives
//! ntty --latin1      # treat console output as ISO-8859-1
//! ```
//!
//! Type a line and press Enter to have it echoed back. ^C, ^\ and ^Z are
//! reported as signals; ^D on an empty line ends the program.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ntty::config::Config;
use ntty::core::console::device::{ConsoleDevice, ConsoleInput};
use ntty::core::console::Console;
use ntty::core::process::{LocalProcessTable, Pid, ProcessInfo};
use ntty::core::pty::{TtyMaster, TtySlave};
use ntty::core::termios::SetAction;
use ntty::{Fhandler, TtyContext, TtyError};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The process owning the console, when terminal objects are process-local.
const MASTER_PID: Pid = 1000;
/// The simulated program on the slave, leader of its own session.
const SHELL_PID: Pid = 1001;

/// Command line options
#[derive(Debug, Default)]
struct Cli {
    charset: Option<&'static str>,
    raw: bool,
    config: Option<PathBuf>,
}

fn print_version() {
    eprintln!("ntty {}", VERSION);
}

fn print_help() {
    eprintln!("ntty {} - POSIX terminals over a console", VERSION);
    eprintln!();
    eprintln!("Usage: ntty [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --utf8                UTF-8 console output (default)");
    eprintln!("  --latin1              ISO-8859-1 console output");
    eprintln!("  --raw                 Run the demo program in non-canonical mode");
    eprintln!("  --config <PATH>       Configuration file (default ~/.ntty/config.toml)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("In the demo: Enter sends a line, ^C/^\\/^Z raise signals, ^D ends.");
    eprintln!();
    eprintln!("Log file: ~/.ntty/ntty.log (level from [log] level or RUST_LOG)");
}

fn parse_args() -> Result<Cli, String> {
    let args: Vec<String> = env::args().collect();
    let mut cli = Cli::default();
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
            "--utf8" => cli.charset = Some("utf-8"),
            "--latin1" => cli.charset = Some("latin1"),
            "--raw" => cli.raw = true,
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config path".to_string());
                }
                cli.config = Some(PathBuf::from(&args[i]));
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Log to a file; the console belongs to the demo.
fn init_logging(config: &Config) {
    let Some(log_path) = config.log.path() else {
        return;
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_thread_names(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

#[cfg(windows)]
fn open_console(ctx: &TtyContext, config: &Config) -> ntty::Result<Arc<Console>> {
    use ntty::core::console::win32::{Win32Console, Win32Input};

    let mouse = config.console.mouse;
    let title = config.console.title.clone();
    ctx.attach_console(0, move || {
        let mut device = Win32Console::open()?;
        device.set_title(&title)?;
        let input = Win32Input::open(mouse)?;
        Ok((Box::new(device) as Box<dyn ConsoleDevice>, Box::new(input) as Box<dyn ConsoleInput>))
    })
}

#[cfg(not(windows))]
fn open_console(ctx: &TtyContext, config: &Config) -> ntty::Result<Arc<Console>> {
    use ntty::core::console::term::{CrosstermInput, TermConsole};

    let mouse = config.console.mouse;
    let fallback = (config.console.cols, config.console.rows);
    let title = config.console.title.clone();
    ctx.attach_console(0, move || {
        let mut device = TermConsole::new(fallback, mouse);
        device.init()?;
        device.set_title(&title)?;
        Ok((Box::new(device) as Box<dyn ConsoleDevice>, Box::new(CrosstermInput::new()) as Box<dyn ConsoleInput>))
    })
}

/// Report signals queued for the demo program.
fn report_signals(slave: &mut TtySlave, procs: &LocalProcessTable) -> ntty::Result<()> {
    for sig in procs.take_signals(SHELL_PID) {
        info!("demo received {}", sig.name());
        slave.write(format!("[{}]\n", sig.name()).as_bytes())?;
    }
    Ok(())
}

/// Echo lines until EOF.
fn echo_lines(slave: &mut TtySlave, procs: &LocalProcessTable) -> ntty::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        slave.write(b"$ ")?;
        match slave.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let line = String::from_utf8_lossy(&buf[..n]);
                slave.write(format!("\x1b[32m{}\x1b[0m", line).as_bytes())?;
            }
            Err(TtyError::Interrupted) => {
                slave.write(b"\n")?;
                report_signals(slave, procs)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Show every key as it arrives until ^D.
fn echo_keys(slave: &mut TtySlave, procs: &LocalProcessTable) -> ntty::Result<()> {
    let mut t = slave.tcgetattr()?;
    t.make_raw();
    slave.tcsetattr(SetAction::Now, &t)?;
    slave.write(b"raw mode, ^D ends\r\n")?;
    let mut buf = [0u8; 64];
    loop {
        match slave.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let shown: Vec<String> = buf[..n].iter().map(|b| format!("{:02x}", b)).collect();
                slave.write(format!("{}\r\n", shown.join(" ")).as_bytes())?;
                if buf[..n].contains(&0x04) {
                    return Ok(());
                }
            }
            Err(TtyError::Interrupted) => report_signals(slave, procs)?,
            Err(e) => return Err(e),
        }
    }
}

/// Machine-wide terminal objects where the platform has them, so other
/// processes can open the pty by unit. The master is then our real pid.
fn context(config: &Config, procs: &Arc<LocalProcessTable>) -> (Arc<TtyContext>, Pid) {
    #[cfg(windows)]
    match TtyContext::machine(config.clone(), procs.clone()) {
        Ok(ctx) => return (ctx, std::process::id()),
        Err(e) => tracing::warn!("running process-local: {}", e),
    }
    (TtyContext::new(config.clone(), procs.clone()), MASTER_PID)
}

fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let procs = Arc::new(LocalProcessTable::new());
    let (ctx, master_pid) = context(&config, &procs);
    procs.insert(ProcessInfo::new(master_pid));
    procs.insert(ProcessInfo::new(SHELL_PID).parent(master_pid));

    let console = open_console(&ctx, &config).context("opening the console")?;
    let master = TtyMaster::open(&ctx, master_pid, console).context("starting the pty master")?;
    let mut slave = TtySlave::open(&ctx, master.unit(), SHELL_PID).context("opening the pty slave")?;
    info!("demo running on /dev/pty{}", master.unit());

    slave.write(format!("ntty {} on /dev/pty{}, ^D ends\n", VERSION, master.unit()).as_bytes())?;
    let result = if cli.raw {
        echo_keys(&mut slave, &procs)
    } else {
        echo_lines(&mut slave, &procs)
    };
    drop(slave);
    drop(master);
    result.context("demo program")
}

fn main() -> anyhow::Result<()> {
    let cli = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if let Some(charset) = cli.charset {
        config.console.charset = charset.to_string();
    }

    init_logging(&config);
    info!("ntty {} starting", VERSION);
    info!("Charset: {}, raw: {}", config.console.charset().name(), cli.raw);

    if let Err(e) = run(&cli, config) {
        error!("ntty failed: {:#}", e);
        return Err(e);
    }
    info!("ntty exiting");
    Ok(())
}
