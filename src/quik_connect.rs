use crate::config::QuikConfig;
use crate::defs::{
    ERROR_SLEEP_TIMEOUT, ERROR_TIMEOUT, IDLE_SLEEP_TIMEOUT, PING, PING_TIMEOUT, QUIT,
    TERMINAL_CHARSET,
};
use crate::errors::{Channel, QuikError};
use crate::frames::{self, Inbound, Payload};
use crate::listener::{QuikListener, QuikRequester};
use crate::response::{PendingResponses, ResponseFuture};
use crate::socket::{LineConnector, SocketConnector};

use encoding_rs::Encoding;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Request ids are unique across every transport in the process.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables of the listening loop.
#[derive(Clone, Debug, PartialEq)]
pub struct QuikConnectOptions {
    /// Pause before reopening the sockets after an error.
    pub error_timeout: Duration,
    /// Period of `ping` lines.
    pub ping_timeout: Duration,
    /// Loop pause when an iteration consumed no lines.
    pub idle_sleep_timeout: Duration,
    /// Loop pause while waiting out `error_timeout`.
    pub error_sleep_timeout: Duration,
    /// Whether malformed inbound lines are reported to the listener.
    ///
    /// `false` silences a terminal that keeps sending broken lines.
    pub raise_parse_exception_to_listener: bool,
}

impl Default for QuikConnectOptions {
    fn default() -> Self {
        Self {
            error_timeout: ERROR_TIMEOUT,
            ping_timeout: PING_TIMEOUT,
            idle_sleep_timeout: IDLE_SLEEP_TIMEOUT,
            error_sleep_timeout: ERROR_SLEEP_TIMEOUT,
            raise_parse_exception_to_listener: true,
        }
    }
}

/// One socket to the terminal with its own lock and error flag.
struct ChannelSlot {
    channel: Channel,
    connector: Mutex<Box<dyn LineConnector>>,
    has_error: AtomicBool,
}

impl ChannelSlot {
    fn new(channel: Channel, connector: Box<dyn LineConnector>) -> Self {
        Self {
            channel,
            connector: Mutex::new(connector),
            has_error: AtomicBool::new(false),
        }
    }

    fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }
}

/// State shared by the listening thread and request submitters.
struct Shared {
    client_id: String,
    charset: &'static Encoding,
    options: QuikConnectOptions,
    mn: ChannelSlot,
    cb: ChannelSlot,
    responses: Mutex<PendingResponses>,
    error_time: Mutex<Option<Instant>>,
    listener: Arc<dyn QuikListener>,
    shutdown_flag: AtomicBool,
}

impl Shared {
    fn slot(&self, channel: Channel) -> &ChannelSlot {
        match channel {
            Channel::Mn => &self.mn,
            Channel::Cb => &self.cb,
        }
    }

    fn has_error(&self) -> bool {
        self.mn.has_error() || self.cb.has_error()
    }

    fn mark_error(&self, slot: &ChannelSlot) {
        slot.has_error.store(true, Ordering::SeqCst);
        *lock(&self.error_time) = Some(Instant::now());
    }

    fn error_timeout_elapsed(&self) -> bool {
        match *lock(&self.error_time) {
            Some(at) => at.elapsed() > self.options.error_timeout,
            None => true,
        }
    }

    /// Writes one line on an open channel; a write failure flags the channel.
    /// A line the charset cannot represent is refused without flagging it.
    fn send_line(&self, slot: &ChannelSlot, line: &str) -> std::io::Result<()> {
        let mut connector = lock(&slot.connector);
        if !connector.is_open() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("{} channel is not open", slot.channel),
            ));
        }
        connector.send(line).inspect_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                log::warn!("{}: refused to send on {}: {}", self.client_id, slot.channel, e);
            } else {
                log::warn!("{}: failed to write to {}: {}", self.client_id, slot.channel, e);
                self.mark_error(slot);
            }
        })
    }

    /// Runs a listener notification, shielding the listening thread from panics.
    fn notify(&self, event: &str, f: impl FnOnce(&dyn QuikListener)) {
        let listener = self.listener.as_ref();
        if panic::catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
            log::error!("{}: listener panicked in {}", self.client_id, event);
        }
    }

    fn notify_exception(&self, channel: Channel, error: QuikError) {
        match channel {
            Channel::Mn => self.notify("on_exception_mn", |l| l.on_exception_mn(error)),
            Channel::Cb => self.notify("on_exception_cb", |l| l.on_exception_cb(error)),
        }
    }
}

/// Connection to the QUIK terminal over its MN and CB socket servers.
///
/// A dedicated listening thread owns the reading side of both sockets, keeps
/// them alive with `ping`, reopens them after failures and routes every
/// inbound frame either to the pending request with the same id or, for
/// callbacks, to the [`QuikListener`]. Requests may be submitted from any
/// thread.
///
/// Start-up order: give the listener its back-reference to this transport,
/// call [`start`](Self::start), then start the listener's execution thread.
/// Shut down in reverse order.
pub struct QuikConnect {
    shared: Arc<Shared>,
    listening_thread: Mutex<Option<JoinHandle<()>>>,
}

impl QuikConnect {
    /// Creates a transport for the terminal at `host` with default tunables.
    pub fn new(
        host: &str,
        port_mn: u16,
        port_cb: u16,
        client_id: &str,
        listener: Arc<dyn QuikListener>,
    ) -> Self {
        let config = QuikConfig {
            host: host.to_string(),
            port_mn,
            port_cb,
            client_id: client_id.to_string(),
        };
        Self::with_options(&config, QuikConnectOptions::default(), listener)
    }

    /// Creates a transport from the `host`/`portMN`/`portCB`/`clientId` keys of `config`.
    pub fn from_config(config: &Value, listener: Arc<dyn QuikListener>) -> Result<Self, QuikError> {
        let config = QuikConfig::from_json(config)?;
        Ok(Self::with_options(
            &config,
            QuikConnectOptions::default(),
            listener,
        ))
    }

    /// Creates a transport over TCP sockets with explicit tunables.
    pub fn with_options(
        config: &QuikConfig,
        options: QuikConnectOptions,
        listener: Arc<dyn QuikListener>,
    ) -> Self {
        Self::with_connectors(
            &config.client_id,
            Box::new(SocketConnector::new(config.host.as_str(), config.port_mn)),
            Box::new(SocketConnector::new(config.host.as_str(), config.port_cb)),
            options,
            listener,
        )
    }

    /// Creates a transport over arbitrary line connectors.
    pub fn with_connectors(
        client_id: &str,
        mn: Box<dyn LineConnector>,
        cb: Box<dyn LineConnector>,
        options: QuikConnectOptions,
        listener: Arc<dyn QuikListener>,
    ) -> Self {
        let charset =
            Encoding::for_label(TERMINAL_CHARSET.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1251);
        Self {
            shared: Arc::new(Shared {
                client_id: client_id.to_string(),
                charset,
                options,
                mn: ChannelSlot::new(Channel::Mn, mn),
                cb: ChannelSlot::new(Channel::Cb, cb),
                responses: Mutex::new(PendingResponses::default()),
                error_time: Mutex::new(None),
                listener,
                shutdown_flag: AtomicBool::new(false),
            }),
            listening_thread: Mutex::new(None),
        }
    }

    /// Identifier sent with every request.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Tunables this transport was built with.
    pub fn options(&self) -> &QuikConnectOptions {
        &self.shared.options
    }

    /// Spawns the listening thread. Calling it on a running transport is a no-op.
    pub fn start(&self) -> Result<(), QuikError> {
        if self.shared.shutdown_flag.load(Ordering::SeqCst) {
            return Err(QuikError::Cancelled(format!(
                "{} transport was shut down",
                self.shared.client_id
            )));
        }
        let mut guard = lock(&self.listening_thread);
        if guard.is_some() {
            log::warn!("{}: listening thread already running", self.shared.client_id);
            return Ok(());
        }

        let listening_loop = ListeningLoop::new(self.shared.clone());
        let handle = thread::Builder::new()
            .name(format!("{}-QuikConnect", self.shared.client_id))
            .spawn(move || listening_loop.run())
            .map_err(|e| {
                QuikError::Cancelled(format!("cannot spawn the listening thread: {}", e))
            })?;
        *guard = Some(handle);
        Ok(())
    }

    /// Stops the listening thread and waits for it.
    ///
    /// Open sockets receive `quit` and are closed, the listener gets its final
    /// `on_close`, and every pending request fails with [`QuikError::Cancelled`].
    /// No listener method is called after this returns.
    pub fn shutdown(&self) {
        self.shared.shutdown_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = lock(&self.listening_thread).take() {
            log::debug!("{}: waiting for the listening thread", self.shared.client_id);
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("{}: listening thread panicked", self.shared.client_id);
            }
        }

        let cancelled = lock(&self.shared.responses).cancel_all();
        if cancelled > 0 {
            log::info!(
                "{}: cancelled {} pending requests on shutdown",
                self.shared.client_id,
                cancelled
            );
        }
    }

    /// Whether the MN channel is in its post-error cool-down.
    pub fn has_error_mn(&self) -> bool {
        self.shared.mn.has_error()
    }

    /// Whether the CB channel is in its post-error cool-down.
    pub fn has_error_cb(&self) -> bool {
        self.shared.cb.has_error()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_responses(&self) -> usize {
        lock(&self.shared.responses).len()
    }

    /// Sends `payload` on `channel` and returns its future response.
    ///
    /// Never blocks on the network for longer than one socket write. The id
    /// is issued and the line written under the pending-table lock, so ids
    /// appear on each channel in increasing order.
    pub fn submit(&self, channel: Channel, payload: Payload, timeout: Duration) -> ResponseFuture {
        let shared = &self.shared;
        if channel == Channel::Mn && matches!(payload, Payload::Callback { .. }) {
            return ResponseFuture::failed(
                None,
                QuikError::UnexpectedFrame {
                    channel,
                    reason: "callback subscriptions are accepted on CB only".to_string(),
                },
            );
        }

        let mut responses = lock(&shared.responses);
        if shared.shutdown_flag.load(Ordering::SeqCst) {
            return ResponseFuture::failed(
                None,
                QuikError::Cancelled(format!("{} transport was shut down", shared.client_id)),
            );
        }

        let id = next_request_id();
        let line = match frames::encode(id, &shared.client_id, &payload) {
            Ok(line) => line,
            Err(e) => {
                return ResponseFuture::failed(
                    Some(id),
                    QuikError::UnexpectedFrame {
                        channel,
                        reason: e.to_string(),
                    },
                );
            }
        };
        if let Err(e) = shared.send_line(shared.slot(channel), &line) {
            return ResponseFuture::failed(Some(id), QuikError::io(channel, e));
        }
        log::trace!(
            "{}: sent request {} on {}: {}",
            shared.client_id,
            id,
            channel,
            payload.describe()
        );
        responses.insert(id, timeout)
    }

    /// Submits a script chunk on MN.
    pub fn submit_mn_chunk(&self, chunk: &str, timeout: Duration) -> ResponseFuture {
        self.submit(Channel::Mn, Payload::chunk(chunk), timeout)
    }

    /// Submits a function call on MN.
    pub fn submit_mn_fn(&self, fname: &str, args: Vec<Value>, timeout: Duration) -> ResponseFuture {
        self.submit(Channel::Mn, Payload::function(fname, args), timeout)
    }

    /// Submits a script chunk on CB.
    pub fn submit_cb_chunk(&self, chunk: &str, timeout: Duration) -> ResponseFuture {
        self.submit(Channel::Cb, Payload::chunk(chunk), timeout)
    }

    /// Submits a function call on CB.
    pub fn submit_cb_fn(&self, fname: &str, args: Vec<Value>, timeout: Duration) -> ResponseFuture {
        self.submit(Channel::Cb, Payload::function(fname, args), timeout)
    }

    /// Subscribes to the `callback` event with a script-level `filter`.
    pub fn submit_cb_callback(
        &self,
        callback: &str,
        filter: &str,
        timeout: Duration,
    ) -> ResponseFuture {
        self.submit(Channel::Cb, Payload::callback(callback, filter), timeout)
    }

    /// Sends a script chunk on MN and waits for the response.
    pub fn execute_mn_chunk(&self, chunk: &str, timeout: Duration) -> Result<Value, QuikError> {
        self.submit_mn_chunk(chunk, timeout).wait()
    }

    /// Calls a function on MN and waits for the response.
    pub fn execute_mn_fn(
        &self,
        fname: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, QuikError> {
        self.submit_mn_fn(fname, args, timeout).wait()
    }

    /// Sends a script chunk on CB and waits for the response.
    pub fn execute_cb_chunk(&self, chunk: &str, timeout: Duration) -> Result<Value, QuikError> {
        self.submit_cb_chunk(chunk, timeout).wait()
    }

    /// Calls a function on CB and waits for the response.
    pub fn execute_cb_fn(
        &self,
        fname: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, QuikError> {
        self.submit_cb_fn(fname, args, timeout).wait()
    }

    /// Subscribes to a callback and waits for the acknowledgement.
    pub fn execute_cb_callback(
        &self,
        callback: &str,
        filter: &str,
        timeout: Duration,
    ) -> Result<Value, QuikError> {
        self.submit_cb_callback(callback, filter, timeout).wait()
    }
}

impl QuikRequester for QuikConnect {
    fn execute(
        &self,
        channel: Channel,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Value, QuikError> {
        self.submit(channel, payload, timeout).wait()
    }
}

impl Drop for QuikConnect {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The listening thread: owns the open/closed state of the socket pair.
///
/// ```text
/// RECONNECT --open ok--> RUNNING --io error--> FAULTED --error timeout--> RECONNECT
///     ^                                                                     |
///     +------------------------------ open failed --------------------------+
/// ```
struct ListeningLoop {
    shared: Arc<Shared>,
    has_open_connectors: bool,
    last_ping_time: Instant,
}

impl ListeningLoop {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            has_open_connectors: false,
            last_ping_time: Instant::now(),
        }
    }

    fn run(mut self) {
        log::info!("{}: listening thread started", self.shared.client_id);
        while !self.shared.shutdown_flag.load(Ordering::SeqCst) {
            self.step();
        }
        if self.has_open_connectors {
            self.close_connectors();
        }
        log::info!("{}: listening thread stopped", self.shared.client_id);
    }

    fn step(&mut self) {
        let shared = self.shared.clone();
        if shared.has_error() {
            if self.has_open_connectors {
                self.close_connectors();
            }
            if shared.error_timeout_elapsed() {
                log::info!("{}: error timeout elapsed, reconnecting", shared.client_id);
                shared.mn.has_error.store(false, Ordering::SeqCst);
                shared.cb.has_error.store(false, Ordering::SeqCst);
            }
        }
        if shared.has_error() {
            self.pause(shared.options.error_sleep_timeout);
            self.sweep();
            return;
        }
        if !self.has_open_connectors && !self.open_connectors() {
            self.sweep();
            return;
        }

        self.ensure_ping();

        let mut count = 0;
        if !shared.mn.has_error() {
            count += self.drain(&shared.mn);
        }
        if !shared.cb.has_error() {
            count += self.drain(&shared.cb);
        }
        self.sweep();
        if count == 0 {
            self.pause(shared.options.idle_sleep_timeout);
        }
    }

    /// Opens both sockets. Any failure leaves both closed and both flagged.
    fn open_connectors(&mut self) -> bool {
        let shared = &self.shared;
        log::info!("{}: opening MN and CB sockets", shared.client_id);
        for slot in [&shared.mn, &shared.cb] {
            let result = lock(&slot.connector).open(shared.charset);
            if let Err(e) = result {
                log::error!("{}: cannot open {}: {}", shared.client_id, slot.channel, e);
                shared.mark_error(slot);
                shared.notify_exception(slot.channel, QuikError::io(slot.channel, e));
            }
        }
        if shared.has_error() {
            shared.mark_error(&shared.mn);
            shared.mark_error(&shared.cb);
            for slot in [&shared.mn, &shared.cb] {
                lock(&slot.connector).close();
            }
            return false;
        }

        self.has_open_connectors = true;
        self.last_ping_time = Instant::now();
        log::info!("{}: MN and CB sockets are open", shared.client_id);
        shared.notify("on_open", |l| l.on_open());
        true
    }

    /// Sends `quit`, closes both sockets and reports `on_close`.
    fn close_connectors(&mut self) {
        let shared = &self.shared;
        for slot in [&shared.mn, &shared.cb] {
            let mut connector = lock(&slot.connector);
            if connector.is_open() {
                let _ = connector.send(QUIT);
            }
            connector.close();
        }
        self.has_open_connectors = false;
        log::info!("{}: MN and CB sockets are closed", shared.client_id);
        shared.notify("on_close", |l| l.on_close());
    }

    fn ensure_ping(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_ping_time) <= self.shared.options.ping_timeout {
            return;
        }
        let shared = &self.shared;
        for slot in [&shared.mn, &shared.cb] {
            let mut connector = lock(&slot.connector);
            if slot.has_error() {
                continue;
            }
            if let Err(e) = connector.send(PING) {
                log::warn!("{}: ping on {} failed: {}", shared.client_id, slot.channel, e);
                shared.mark_error(slot);
            }
        }
        self.last_ping_time = now;
    }

    /// Reads every buffered line of one channel. Returns how many were read.
    fn drain(&self, slot: &ChannelSlot) -> usize {
        let shared = &self.shared;
        let mut count = 0;
        loop {
            let received = lock(&slot.connector).receive();
            let line = match received {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::error!("{}: {} receive failed: {}", shared.client_id, slot.channel, e);
                    shared.mark_error(slot);
                    shared.notify_exception(slot.channel, QuikError::io(slot.channel, e));
                    break;
                }
            };
            count += 1;

            match frames::classify(slot.channel, &line) {
                Ok(Inbound::Pong) => {}
                Ok(Inbound::Callback { name, frame }) => {
                    log::trace!("{}: callback {}", shared.client_id, name);
                    shared.notify("on_callback", |l| l.on_callback(frame));
                }
                Ok(Inbound::Response { id, frame }) => {
                    if !lock(&shared.responses).complete(id, frame) {
                        log::trace!(
                            "{}: dropped response {} on {}: no pending request",
                            shared.client_id,
                            id,
                            slot.channel
                        );
                    }
                }
                Ok(Inbound::Unrouted(frame)) => {
                    log::trace!(
                        "{}: dropped frame without id on {}: {}",
                        shared.client_id,
                        slot.channel,
                        frame
                    );
                }
                Err(e @ QuikError::Parse { .. }) => {
                    log::warn!("{}: {}", shared.client_id, e);
                    if shared.options.raise_parse_exception_to_listener {
                        shared.notify_exception(slot.channel, e);
                    }
                }
                Err(e) => {
                    log::warn!("{}: {}", shared.client_id, e);
                    shared.notify_exception(slot.channel, e);
                }
            }
        }
        count
    }

    fn sweep(&self) {
        let swept = lock(&self.shared.responses).sweep(Instant::now());
        if swept > 0 {
            log::trace!(
                "{}: swept {} expired requests",
                self.shared.client_id,
                swept
            );
        }
    }

    /// Sleeps for `duration` unless `shutdown` wakes the thread earlier.
    fn pause(&self, duration: Duration) {
        if !self.shared.shutdown_flag.load(Ordering::SeqCst) {
            thread::park_timeout(duration);
        }
    }
}
