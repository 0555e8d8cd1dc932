//! # QUIK Probe
//!
//! Opens the bridge, waits for both sockets, then issues a fixed list of
//! correct and deliberately broken requests and logs each response with its
//! latency.
//!
//! ## Command-line Options
//! - `--config` / `-c`: JSON file with `host`, `portMN`, `portCB`, `clientId`.
//! - `--log-level` / `-l`: Log level (`error`, `warn`, `info`, `debug`, `trace`).
//! - `--run-secs` / `-r`: How long to keep logging callbacks after the requests.

use quik_bridge::class_sec_code::ClassSecCode;
use quik_bridge::config::QuikConfig;
use quik_bridge::errors::{CliError, QuikError};
use quik_bridge::listener::QuikListener;
use quik_bridge::logger::init_logger;
use quik_bridge::quik_connect::{QuikConnect, QuikConnectOptions};
use quik_bridge::requests::{CandlesRequest, Level2QuotesRequest, QuikRequest};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line options for the probe
#[derive(Debug, StructOpt)]
#[structopt(name = "quik_probe", about = "Issues test requests to a QUIK terminal")]
struct Opt {
    /// Path to the JSON bridge configuration
    #[structopt(short, long)]
    config: String,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,

    /// Seconds to keep logging callbacks after the requests
    #[structopt(short, long, default_value = "10")]
    run_secs: u64,
}

/// Logs every transport event as it happens.
#[derive(Default)]
struct LoggingListener {
    is_open: AtomicBool,
}

impl QuikListener for LoggingListener {
    fn on_open(&self) {
        log::info!("onOpen");
        self.is_open.store(true, Ordering::SeqCst);
    }

    fn on_close(&self) {
        log::info!("onClose");
        self.is_open.store(false, Ordering::SeqCst);
    }

    fn on_callback(&self, frame: Value) {
        log::info!("onCallback {}", frame);
    }

    fn on_exception_mn(&self, error: QuikError) {
        log::error!("onExceptionMN: {}", error);
    }

    fn on_exception_cb(&self, error: QuikError) {
        log::error!("onExceptionCB: {}", error);
    }
}

fn request(call: impl FnOnce() -> Result<Value, QuikError>) {
    let start = Instant::now();
    let result = call();
    let elapsed = start.elapsed().as_millis();
    match result {
        Ok(response) => log::info!("{} ms; {}", elapsed, response),
        Err(e) => log::error!("{} ms; {}", elapsed, e),
    }
}

fn run_requests(quik: &QuikConnect) {
    let aflt = ClassSecCode::new("TQBR", "AFLT");
    let aflt_filter = "function(t) return t.class_code == \"TQBR\" and t.sec_code == \"AFLT\" end";

    log::info!("Correct requests:");
    request(|| quik.execute_mn_chunk("message(\"Hello, QLua-world!\", 2)", REQUEST_TIMEOUT));
    request(|| quik.execute_cb_chunk("return os.sysdate()", REQUEST_TIMEOUT));
    request(|| quik.execute_mn_fn("os.sysdate", vec![], REQUEST_TIMEOUT));
    request(|| quik.execute_cb_fn("os.sysdate", vec![], REQUEST_TIMEOUT));
    request(|| quik.execute_mn_fn("isConnected", vec![], REQUEST_TIMEOUT));
    request(|| {
        quik.execute_mn_fn(
            "math.max",
            vec![json!(1), json!(3), json!(5), json!(7)],
            REQUEST_TIMEOUT,
        )
    });
    request(|| quik.execute_mn_fn("message", vec![json!("Hi, there!"), json!(1)], REQUEST_TIMEOUT));

    log::info!("Erroneous requests:");
    request(|| quik.execute_mn_chunk("return string(((", REQUEST_TIMEOUT));
    request(|| quik.execute_mn_chunk("return math.max(\"ABC\", 15)", REQUEST_TIMEOUT));
    request(|| quik.execute_mn_fn("mess", vec![], REQUEST_TIMEOUT));
    request(|| quik.execute_mn_fn("math.max", vec![json!("ABC"), json!(15)], REQUEST_TIMEOUT));

    log::info!("Correct requests:");
    request(|| quik.execute_mn_chunk("return initDataSource(\"TQBR\", \"AFLT\", 1)", REQUEST_TIMEOUT));
    request(|| {
        quik.execute_mn_chunk(
            &CandlesRequest::new(aflt.clone(), 1, 5).request(),
            REQUEST_TIMEOUT,
        )
    });
    request(|| quik.execute_mn_chunk(&Level2QuotesRequest::new(aflt.clone()).request(), REQUEST_TIMEOUT));
    request(|| quik.execute_cb_callback("OnAllTrade", aflt_filter, REQUEST_TIMEOUT));
    request(|| quik.execute_cb_callback("OnCandle", aflt_filter, REQUEST_TIMEOUT));
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();
    init_logger(&opt.log_level)?;

    log::info!("Starting QUIK probe");
    log::debug!("Command line options: {:?}", opt);

    let config = QuikConfig::from_file(&opt.config)?;
    let listener = Arc::new(LoggingListener::default());
    let quik = QuikConnect::with_options(&config, QuikConnectOptions::default(), listener.clone());
    quik.start()?;

    let start = Instant::now();
    while !listener.is_open.load(Ordering::SeqCst) {
        if start.elapsed() > OPEN_TIMEOUT {
            quik.shutdown();
            return Err(CliError::GeneralError(format!(
                "Terminal did not open within {:?}",
                OPEN_TIMEOUT
            )));
        }
        thread::sleep(Duration::from_millis(100));
    }

    if quik.has_error_mn() || quik.has_error_cb() {
        log::warn!("Transport reports errors, requests may fail");
    }
    run_requests(&quik);

    log::info!("Listening for callbacks for {} s", opt.run_secs);
    thread::sleep(Duration::from_secs(opt.run_secs));

    log::info!("Shutting down QUIK probe");
    quik.shutdown();
    Ok(())
}
