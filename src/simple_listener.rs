use crate::class_sec_code::ClassSecCode;
use crate::defs::{
    CHECK_CONNECTED_PERIOD, ONLINE_DURATION, PAUSE_AFTER_EXCEPTION, REQUEST_TIMEOUT,
    SUBSCRIPTION_PERIOD,
};
use crate::errors::{Channel, QuikError};
use crate::frames::Payload;
use crate::listener::{QuikListener, QuikRequester, Task, TaskQueue, TaskSubmitter};
use crate::requests::{
    BulkLevel2QuotesSubscriptionRequest, CandlesSubscriptionRequest, ParamSubscriptionRequest,
    QuikRequest,
};
use crate::response::deadline_after;

use serde_json::{Value, json};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Application hook for callbacks other than `OnConnected`/`OnDisconnected`.
pub type CallbackHandler = Box<dyn FnMut(&str, &Value) + Send>;

/// Session manager for a single terminal connection.
///
/// Keeps checking the terminal with `isConnected()` and (re)subscribes to the
/// configured callbacks and market data after every reconnect. All state is
/// owned by the thread that drives [`step`](Self::step); the transport reaches
/// it only through tasks queued by the listener half returned from
/// [`listener`](Self::listener).
///
/// ```no_run
/// use quik_bridge::quik_connect::QuikConnect;
/// use quik_bridge::simple_listener::SimpleQuikListener;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let mut session = SimpleQuikListener::new();
/// session.add_callback_subscription("OnAllTrade", "*");
/// let quik = Arc::new(QuikConnect::new("127.0.0.1", 10001, 10002, "bot", session.listener()));
/// session.set_quik_connect(quik.clone());
/// quik.start()?;
/// loop {
///     session.step()?;
///     std::thread::sleep(Duration::from_millis(100));
/// }
/// # Ok::<(), quik_bridge::errors::QuikError>(())
/// ```
pub struct SimpleQuikListener {
    queue: TaskQueue<SimpleQuikListener>,
    quik_connect: Option<Arc<dyn QuikRequester>>,
    execution_thread: ThreadId,

    request_timeout: Duration,
    pause_after_exception: Duration,
    check_connected_period: Duration,
    subscription_period: Duration,
    online_duration: Duration,
    log_prefix: String,

    callback_subscriptions: Vec<(String, String)>,
    security_parameters: Vec<(ClassSecCode, Vec<String>)>,
    security_candles: Vec<(ClassSecCode, Vec<u32>)>,
    level2_quotes: Vec<ClassSecCode>,
    callback_handler: Option<CallbackHandler>,

    is_open: bool,
    connected_since: Option<Instant>,
    next_check_connection_time: Option<Instant>,
    is_subscribed: bool,
    next_subscription_time: Option<Instant>,
}

impl Default for SimpleQuikListener {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimpleQuikListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleQuikListener")
            .field("log_prefix", &self.log_prefix)
            .field("is_open", &self.is_open)
            .field("connected_since", &self.connected_since)
            .field("is_subscribed", &self.is_subscribed)
            .finish_non_exhaustive()
    }
}

impl SimpleQuikListener {
    /// Creates a session owned by the current thread, subscribed to `OnDisconnected`.
    pub fn new() -> Self {
        Self {
            queue: TaskQueue::new(),
            quik_connect: None,
            execution_thread: thread::current().id(),
            request_timeout: REQUEST_TIMEOUT,
            pause_after_exception: PAUSE_AFTER_EXCEPTION,
            check_connected_period: CHECK_CONNECTED_PERIOD,
            subscription_period: SUBSCRIPTION_PERIOD,
            online_duration: ONLINE_DURATION,
            log_prefix: String::new(),
            callback_subscriptions: vec![("OnDisconnected".to_string(), "*".to_string())],
            security_parameters: Vec::new(),
            security_candles: Vec::new(),
            level2_quotes: Vec::new(),
            callback_handler: None,
            is_open: false,
            connected_since: None,
            next_check_connection_time: None,
            is_subscribed: false,
            next_subscription_time: None,
        }
    }

    /// Installs the transport requests are sent through.
    pub fn set_quik_connect(&mut self, quik_connect: Arc<dyn QuikRequester>) {
        self.quik_connect = Some(quik_connect);
    }

    /// Listener half to hand to the transport.
    pub fn listener(&self) -> Arc<dyn QuikListener> {
        Arc::new(SessionEvents {
            tasks: self.queue.submitter(),
        })
    }

    /// Thread that drains the task queue.
    pub fn execution_thread(&self) -> ThreadId {
        self.execution_thread
    }

    /// Enqueues a task for the execution thread.
    pub fn submit(&self, task: impl FnOnce(&mut Self) + Send + 'static) {
        self.queue.submit(task);
    }

    /// Takes the oldest queued task, if any.
    pub fn poll(&self) -> Option<Task<Self>> {
        self.queue.poll()
    }

    /// Runs every queued task in FIFO order. Returns how many ran.
    ///
    /// The calling thread becomes the execution thread. A panicking task is
    /// logged and the remaining tasks still run.
    pub fn process_tasks(&mut self) -> usize {
        self.execution_thread = thread::current().id();
        let mut count = 0;
        while let Some(task) = self.queue.poll() {
            if panic::catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                log::error!("{}Task panicked", self.log_prefix);
            }
            count += 1;
        }
        count
    }

    /// One turn of the execution thread: queued tasks, then connection and
    /// subscription upkeep. Returns how many tasks ran.
    ///
    /// Fails only with [`QuikError::Cancelled`] or [`QuikError::NotStarted`];
    /// every other failure is handled by rescheduling.
    pub fn step(&mut self) -> Result<usize, QuikError> {
        let count = self.process_tasks();
        self.ensure_connection()?;
        self.ensure_subscription()?;
        Ok(count)
    }

    /// Sets the deadline of every request the session issues.
    pub fn set_request_timeout(&mut self, duration: Duration) {
        self.request_timeout = duration;
    }

    /// Sets the quiet period after a channel exception.
    pub fn set_pause_after_exception(&mut self, duration: Duration) {
        self.pause_after_exception = duration;
    }

    /// Sets the period of the `isConnected()` check.
    pub fn set_check_connected_period(&mut self, duration: Duration) {
        self.check_connected_period = duration;
    }

    /// Sets the retry period of a failed subscription round.
    pub fn set_subscription_period(&mut self, duration: Duration) {
        self.subscription_period = duration;
    }

    /// Sets how long the terminal must stay connected before the session is online.
    pub fn set_online_duration(&mut self, duration: Duration) {
        self.online_duration = duration;
    }

    /// Sets the prefix of every log line of this session.
    pub fn set_log_prefix(&mut self, log_prefix: impl Into<String>) {
        self.log_prefix = log_prefix.into();
    }

    /// Installs the hook for application callbacks.
    pub fn set_callback_handler(&mut self, handler: impl FnMut(&str, &Value) + Send + 'static) {
        self.callback_handler = Some(Box::new(handler));
    }

    /// Subscribes to `callback` with `filter`, replacing an earlier filter.
    pub fn add_callback_subscription(&mut self, callback: &str, filter: &str) {
        match self
            .callback_subscriptions
            .iter_mut()
            .find(|(name, _)| name == callback)
        {
            Some((_, existing)) => *existing = filter.to_string(),
            None => self
                .callback_subscriptions
                .push((callback.to_string(), filter.to_string())),
        }
    }

    /// Orders trading-table parameters of `instrument`.
    pub fn add_security_parameters<I, S>(&mut self, instrument: &ClassSecCode, parameters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = entry(&mut self.security_parameters, instrument);
        for parameter in parameters {
            let parameter = parameter.into();
            if !set.contains(&parameter) {
                set.push(parameter);
            }
        }
    }

    /// Orders candle data of `instrument` for the given intervals.
    pub fn add_security_candles(
        &mut self,
        instrument: &ClassSecCode,
        intervals: impl IntoIterator<Item = u32>,
    ) {
        let set = entry(&mut self.security_candles, instrument);
        for interval in intervals {
            if !set.contains(&interval) {
                set.push(interval);
            }
        }
    }

    /// Orders order-book updates of `instrument`.
    pub fn add_level2_quotes(&mut self, instrument: &ClassSecCode) {
        if !self.level2_quotes.contains(instrument) {
            self.level2_quotes.push(instrument.clone());
        }
    }

    /// Whether both transport sockets are open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// When the terminal was first seen connected, if it still is.
    pub fn connected_since(&self) -> Option<Instant> {
        self.connected_since
    }

    /// Whether the terminal reports itself connected to its server.
    pub fn is_connected(&self) -> bool {
        self.connected_since.is_some()
    }

    /// Whether the last subscription round succeeded.
    pub fn is_subscribed(&self) -> bool {
        self.is_subscribed
    }

    /// Open, subscribed, and connected for at least the online duration.
    pub fn is_online(&self) -> bool {
        self.is_open
            && self.is_subscribed
            && self
                .connected_since
                .is_some_and(|since| since.elapsed() >= self.online_duration)
    }

    /// Calls `isConnected()` when the connection check is due.
    pub fn ensure_connection(&mut self) -> Result<(), QuikError> {
        if !self.is_open || !is_due(self.next_check_connection_time) {
            return Ok(());
        }
        match self.execute(Channel::Mn, Payload::function("isConnected", vec![])) {
            Ok(response) if response.get("result") == Some(&json!(1)) => self.on_connected(),
            Ok(_) => self.on_disconnected(),
            Err(e) => {
                log::trace!("{}isConnected failed: {}", self.log_prefix, e);
                self.on_disconnected();
                if e.is_cancelled() || matches!(e, QuikError::NotStarted) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Runs a subscription round when one is due.
    pub fn ensure_subscription(&mut self) -> Result<(), QuikError> {
        if !self.is_open || self.is_subscribed || !is_due(self.next_subscription_time) {
            return Ok(());
        }
        match self.subscribe() {
            Err(e) if e.is_cancelled() || matches!(e, QuikError::NotStarted) => Err(e),
            _ => Ok(()),
        }
    }

    /// Subscribes to every configured callback, parameter set, candle set and
    /// order book, in that order, stopping at the first failure.
    ///
    /// A failure schedules the next round one subscription period from now.
    pub fn subscribe(&mut self) -> Result<(), QuikError> {
        let result = self.run_subscription();
        match &result {
            Ok(()) => self.is_subscribed = true,
            Err(_) => {
                self.is_subscribed = false;
                self.next_subscription_time = deadline_after(self.subscription_period);
            }
        }
        result
    }

    /// Forgets the connection state and stays quiet for the post-exception pause.
    ///
    /// A pause too long to schedule leaves both checks unscheduled.
    pub fn schedule_recovery(&mut self) {
        let at = deadline_after(self.pause_after_exception);
        self.connected_since = None;
        self.next_check_connection_time = at;
        self.is_subscribed = false;
        self.next_subscription_time = at;
    }

    fn requester(&self) -> Result<Arc<dyn QuikRequester>, QuikError> {
        self.quik_connect.clone().ok_or(QuikError::NotStarted)
    }

    fn execute(&self, channel: Channel, payload: Payload) -> Result<Value, QuikError> {
        self.requester()?
            .execute(channel, payload, self.request_timeout)
    }

    fn run_subscription(&self) -> Result<(), QuikError> {
        for (callback, filter) in &self.callback_subscriptions {
            self.subscribe_to_callback(callback, filter)?;
        }
        for (instrument, parameters) in &self.security_parameters {
            self.subscribe_to_parameters(instrument, parameters)?;
        }
        for (instrument, intervals) in &self.security_candles {
            self.subscribe_to_candles(instrument, intervals)?;
        }
        if !self.level2_quotes.is_empty() {
            self.subscribe_to_level2_quotes()?;
        }
        Ok(())
    }

    fn fail(&self, message: String) -> QuikError {
        log::error!("{}{}", self.log_prefix, message);
        QuikError::Subscription(message)
    }

    fn subscribe_to_callback(&self, callback: &str, filter: &str) -> Result<(), QuikError> {
        let response = self.execute(Channel::Cb, Payload::callback(callback, filter))?;
        if response.get("status") != Some(&Value::Bool(true)) {
            return Err(self.fail(format!("Cannot subscribe to callback {}.", callback)));
        }
        log::debug!("{}Subscribed to callback {}.", self.log_prefix, callback);
        Ok(())
    }

    fn subscribe_to_parameters(
        &self,
        instrument: &ClassSecCode,
        parameters: &[String],
    ) -> Result<(), QuikError> {
        let request = ParamSubscriptionRequest::new(instrument.clone(), parameters.to_vec());
        let response = self.execute(Channel::Mn, request.payload())?;
        if response.get("result") != Some(&Value::Bool(true)) {
            return Err(self.fail(format!(
                "Cannot subscribe to {} parameters {:?}.",
                instrument, parameters
            )));
        }
        log::debug!(
            "{}Subscribed to {} {:?}.",
            self.log_prefix,
            instrument,
            parameters
        );
        Ok(())
    }

    fn subscribe_to_candles(
        &self,
        instrument: &ClassSecCode,
        intervals: &[u32],
    ) -> Result<(), QuikError> {
        let request = CandlesSubscriptionRequest::new(instrument.clone(), intervals.to_vec());
        let response = self.execute(Channel::Mn, request.payload())?;
        let Some(result) = response.get("result").and_then(Value::as_object) else {
            return Err(self.fail(format!(
                "Cannot subscribe to {} candles for intervals {:?}.",
                instrument, intervals
            )));
        };

        let mut failure = None;
        for interval in intervals {
            let status = result.get(&interval.to_string());
            if status != Some(&json!("ok")) {
                failure = Some(self.fail(format!(
                    "Cannot subscribe to {} candles for interval {}: {}",
                    instrument,
                    interval,
                    status.unwrap_or(&Value::Null)
                )));
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        log::debug!(
            "{}Subscribed to {} candles for intervals {:?}.",
            self.log_prefix,
            instrument,
            intervals
        );
        Ok(())
    }

    fn subscribe_to_level2_quotes(&self) -> Result<(), QuikError> {
        let request = BulkLevel2QuotesSubscriptionRequest::new(self.level2_quotes.clone());
        let response = self.execute(Channel::Mn, request.payload())?;
        let entries: Vec<&Value> = match response.get("result") {
            Some(Value::Array(entries)) => entries.iter().collect(),
            Some(Value::Object(entries)) => entries.values().collect(),
            _ => return Err(self.fail("Cannot subscribe to Level2 quotes.".to_string())),
        };

        let mut failure = None;
        for entry in &entries {
            let class_code = entry.get("classCode").and_then(Value::as_str).unwrap_or("?");
            let sec_code = entry.get("secCode").and_then(Value::as_str).unwrap_or("?");
            if entry.get("subscribed") == Some(&Value::Bool(true)) {
                log::debug!(
                    "{}Subscribed to Level2 quotes for {}:{}.",
                    self.log_prefix,
                    class_code,
                    sec_code
                );
            } else {
                failure = Some(self.fail(format!(
                    "Cannot subscribe to Level2 quotes for {}:{}.",
                    class_code, sec_code
                )));
            }
        }
        if entries.len() < self.level2_quotes.len() {
            failure = Some(self.fail(format!(
                "Level2 subscription answered {} of {} instruments.",
                entries.len(),
                self.level2_quotes.len()
            )));
        }
        failure.map_or(Ok(()), Err)
    }

    fn handle_open(&mut self) {
        log::debug!("{}onOpen", self.log_prefix);
        let now = Instant::now();
        self.is_open = true;
        self.connected_since = None;
        self.next_check_connection_time = Some(now);
        self.is_subscribed = false;
        self.next_subscription_time = Some(now);
    }

    fn handle_close(&mut self) {
        log::debug!("{}onClose", self.log_prefix);
        self.is_open = false;
        self.connected_since = None;
        self.next_check_connection_time = None;
        self.is_subscribed = false;
        self.next_subscription_time = None;
    }

    fn handle_callback(&mut self, callback: &str, frame: &Value) {
        log::trace!("{}onCallback {}", self.log_prefix, callback);
        log::trace!("{}{}", self.log_prefix, frame);
        match callback {
            "OnConnected" => self.on_connected(),
            "OnDisconnected" => self.on_disconnected(),
            _ => {
                if let Some(handler) = self.callback_handler.as_mut() {
                    handler(callback, frame);
                }
            }
        }
    }

    fn handle_exception(&mut self, channel: Channel, error: QuikError) {
        log::error!("{}onException{}: {}", self.log_prefix, channel, error);
        self.schedule_recovery();
    }

    fn on_connected(&mut self) {
        let now = Instant::now();
        if self.connected_since.is_none() {
            self.connected_since = Some(now);
            log::debug!("{}Quik is connected.", self.log_prefix);
        }
        log::trace!(
            "{}isOnline: {}, connectedSince: {:?}",
            self.log_prefix,
            self.is_online(),
            self.connected_since
        );
        self.next_check_connection_time = now.checked_add(self.check_connected_period);
    }

    fn on_disconnected(&mut self) {
        if self.connected_since.take().is_some() {
            log::debug!("{}Quik is disconnected.", self.log_prefix);
        }
        self.next_check_connection_time = deadline_after(self.check_connected_period);
    }
}

fn is_due(at: Option<Instant>) -> bool {
    at.is_some_and(|at| Instant::now() >= at)
}

fn entry<'a, T>(table: &'a mut Vec<(ClassSecCode, Vec<T>)>, key: &ClassSecCode) -> &'a mut Vec<T> {
    let index = match table.iter().position(|(k, _)| k == key) {
        Some(index) => index,
        None => {
            table.push((key.clone(), Vec::new()));
            table.len() - 1
        }
    };
    &mut table[index].1
}

/// Listener half of a [`SimpleQuikListener`]: turns every notification into
/// a task on the session's queue.
#[derive(Debug)]
pub struct SessionEvents {
    tasks: TaskSubmitter<SimpleQuikListener>,
}

impl SessionEvents {
    fn submit(&self, task: impl FnOnce(&mut SimpleQuikListener) + Send + 'static) {
        if !self.tasks.submit(task) {
            log::debug!("Session is gone, dropping transport event");
        }
    }
}

impl QuikListener for SessionEvents {
    fn on_open(&self) {
        self.submit(SimpleQuikListener::handle_open);
    }

    fn on_close(&self) {
        self.submit(SimpleQuikListener::handle_close);
    }

    fn on_callback(&self, frame: Value) {
        let callback = frame
            .get("callback")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.submit(move |session| session.handle_callback(&callback, &frame));
    }

    fn on_exception_mn(&self, error: QuikError) {
        self.submit(move |session| session.handle_exception(Channel::Mn, error));
    }

    fn on_exception_cb(&self, error: QuikError) {
        self.submit(move |session| session.handle_exception(Channel::Cb, error));
    }
}
