use std::error::Error;
use std::io;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use named_rwlock::{shutdown, NamedRwLock, RwLockConfig, RwLockError};

/// Cross-process reader-writer lock addressed by name.
///
/// Each invocation performs one operation and exits; the lock state lives in
/// a named semaphore and a named shared memory segment. Containers must share
/// the IPC namespace (e.g. `--ipc=host`) to share a lock.
#[derive(clap::Parser)]
#[clap(name = "rwlock", version)]
struct Opts {
    /// Name of the lock
    name: String,
    #[clap(value_enum)]
    operation: Operation,
    /// TOML file with a [lock] table
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(long = "poll-interval-ms")]
    poll_interval_ms: Option<u64>,
    /// Give up waiting for rlock/wlock after this long
    #[clap(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Remove the named semaphore and shared memory when done
    #[clap(long = "unlink-on-exit")]
    unlink_on_exit: bool,
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Operation {
    Rlock,
    Runlock,
    Wlock,
    Wunlock,
    Stat,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CliConfig {
    #[serde(default)]
    lock: RwLockConfig,
}

const EXIT_INCONSISTENT: u8 = 255;
const EXIT_TIMEOUT: u8 = 124;
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            eprint!("{}", usage_error(&e));
            return ExitCode::from(2);
        }
    };
    init_logging(opts.verbose);
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rwlock: {}", e);
            exit_code(e.as_ref())
        }
    }
}

/// clap leaves the usage line out of some errors, e.g. an unknown operation.
fn usage_error(e: &clap::Error) -> String {
    let mut msg = e.to_string();
    if !msg.contains("USAGE") {
        if !msg.ends_with('\n') {
            msg.push('\n');
        }
        msg.push('\n');
        msg.push_str(&Opts::command().render_usage());
        msg.push('\n');
    }
    msg
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(opts: &Opts) -> Result<RwLockConfig, Box<dyn Error>> {
    let mut cfg = match &opts.config {
        Some(path) => {
            let file: CliConfig = confy::load_path(path)?;
            file.lock
        }
        None => RwLockConfig::default(),
    };
    if let Some(v) = opts.poll_interval_ms {
        cfg.poll_interval_ms = v;
    }
    if opts.timeout_ms.is_some() {
        cfg.timeout_ms = opts.timeout_ms;
    }
    if opts.unlink_on_exit {
        cfg.unlink_on_drop = true;
    }
    Ok(cfg)
}

fn run(opts: &Opts) -> Result<(), Box<dyn Error>> {
    let cfg = load_config(opts)?;
    debug!(?cfg, operation = ?opts.operation, "starting");
    let closing = shutdown::flag()?;
    let mut lock = NamedRwLock::open(&opts.name, &cfg)?.with_cancel(closing);
    match opts.operation {
        Operation::Rlock => lock.rlock()?,
        Operation::Runlock => lock.runlock()?,
        Operation::Wlock => lock.wlock()?,
        Operation::Wunlock => lock.wunlock()?,
        Operation::Stat => println!("{}", lock.stat()?),
    }
    Ok(())
}

fn exit_code(e: &(dyn Error + 'static)) -> ExitCode {
    match e.downcast_ref::<RwLockError>() {
        Some(RwLockError::Inconsistent { .. }) => ExitCode::from(EXIT_INCONSISTENT),
        Some(RwLockError::Timeout { .. }) => ExitCode::from(EXIT_TIMEOUT),
        Some(RwLockError::Interrupted { .. }) => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::FAILURE,
    }
}
