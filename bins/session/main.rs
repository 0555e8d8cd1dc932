//! # QUIK Session
//!
//! Connects to a QUIK terminal, keeps the session subscribed and logs every
//! callback it receives.
//!
//! ## Command-line Options
//! - `--config` / `-c`: JSON file with `host`, `portMN`, `portCB`, `clientId`.
//! - `--log-level` / `-l`: Log level (`error`, `warn`, `info`, `debug`, `trace`).
//! - `--run-secs` / `-r`: How long to run; `0` runs until killed.
//! - `--callback NAME[=FILTER]`: Callback subscription, filter defaults to `*`.
//! - `--params CLASS:SEC=P1,P2`: Trading-table parameters of an instrument.
//! - `--candles CLASS:SEC=1,5`: Candle intervals of an instrument.
//! - `--level2 CLASS:SEC`: Order book of an instrument.

use quik_bridge::class_sec_code::ClassSecCode;
use quik_bridge::config::QuikConfig;
use quik_bridge::errors::CliError;
use quik_bridge::logger::init_logger;
use quik_bridge::quik_connect::{QuikConnect, QuikConnectOptions};
use quik_bridge::simple_listener::SimpleQuikListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

const STEP_PERIOD: Duration = Duration::from_millis(100);

/// Command-line options for the session runner
#[derive(Debug, StructOpt)]
#[structopt(
    name = "quik_session",
    about = "Keeps a subscribed session with a QUIK terminal"
)]
struct Opt {
    /// Path to the JSON bridge configuration
    #[structopt(short, long)]
    config: String,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,

    /// Seconds to run; 0 runs until the process is killed
    #[structopt(short, long, default_value = "0")]
    run_secs: u64,

    /// Callback subscription, NAME or NAME=FILTER
    #[structopt(long)]
    callback: Vec<String>,

    /// Parameter subscription, CLASS:SEC=P1,P2
    #[structopt(long)]
    params: Vec<String>,

    /// Candle subscription, CLASS:SEC=1,5
    #[structopt(long)]
    candles: Vec<String>,

    /// Order-book subscription, CLASS:SEC
    #[structopt(long)]
    level2: Vec<String>,
}

fn parse_instrument(s: &str) -> Result<ClassSecCode, CliError> {
    ClassSecCode::parse(s)
        .ok_or_else(|| CliError::GeneralError(format!("Expected CLASS:SEC, got {:?}", s)))
}

/// Splits `CLASS:SEC=A,B` into the instrument and its list.
fn parse_instrument_list(s: &str) -> Result<(ClassSecCode, Vec<String>), CliError> {
    let (instrument, list) = s
        .split_once('=')
        .ok_or_else(|| CliError::GeneralError(format!("Expected CLASS:SEC=A,B, got {:?}", s)))?;
    let items = list
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect();
    Ok((parse_instrument(instrument)?, items))
}

fn configure(session: &mut SimpleQuikListener, opt: &Opt) -> Result<(), CliError> {
    for spec in &opt.callback {
        let (name, filter) = spec.split_once('=').unwrap_or((spec.as_str(), "*"));
        session.add_callback_subscription(name, filter);
    }
    for spec in &opt.params {
        let (instrument, params) = parse_instrument_list(spec)?;
        session.add_security_parameters(&instrument, params);
    }
    for spec in &opt.candles {
        let (instrument, intervals) = parse_instrument_list(spec)?;
        let intervals = intervals
            .iter()
            .map(|i| {
                i.parse::<u32>()
                    .map_err(|e| CliError::GeneralError(format!("Bad interval {:?}: {}", i, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        session.add_security_candles(&instrument, intervals);
    }
    for spec in &opt.level2 {
        session.add_level2_quotes(&parse_instrument(spec)?);
    }
    Ok(())
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();
    init_logger(&opt.log_level)?;

    log::info!("Starting QUIK session");
    log::debug!("Command line options: {:?}", opt);

    let config = QuikConfig::from_file(&opt.config)?;

    let mut session = SimpleQuikListener::new();
    session.set_log_prefix(format!("[{}] ", config.client_id));
    session.set_callback_handler(|name, frame| log::info!("{}: {}", name, frame));
    configure(&mut session, &opt)?;

    let quik = Arc::new(QuikConnect::with_options(
        &config,
        QuikConnectOptions::default(),
        session.listener(),
    ));
    session.set_quik_connect(quik.clone());
    quik.start()?;

    let deadline = Instant::now()
        .checked_add(Duration::from_secs(opt.run_secs))
        .filter(|_| opt.run_secs > 0);
    let mut was_online = false;
    while deadline.is_none_or(|d| Instant::now() < d) {
        session.step()?;
        if session.is_online() != was_online {
            was_online = session.is_online();
            log::info!("Session online: {}", was_online);
        }
        thread::sleep(STEP_PERIOD);
    }

    log::info!("Shutting down QUIK session");
    quik.shutdown();
    session.process_tasks();
    log::info!("Session shutdown complete");
    Ok(())
}
