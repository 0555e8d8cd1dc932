//! Scripted loopback terminal for tests.
//!
//! Listens on two ephemeral ports (MN and CB), answers `ping` with `pong`,
//! records every received line and answers JSON requests through a handler.

use crate::defs::{PING, PONG};
use crate::errors::{Channel, QuikError};
use crate::listener::QuikListener;

use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(5);
const READ_TIMEOUT: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler = dyn Fn(Channel, &Value) -> Option<Value> + Send + Sync;

#[derive(Default)]
struct Side {
    received: Mutex<Vec<String>>,
    connections: Mutex<Vec<TcpStream>>,
}

struct TerminalState {
    handler: Box<Handler>,
    mn: Side,
    cb: Side,
    stop: AtomicBool,
}

impl TerminalState {
    fn side(&self, channel: Channel) -> &Side {
        match channel {
            Channel::Mn => &self.mn,
            Channel::Cb => &self.cb,
        }
    }
}

pub(crate) struct FakeTerminal {
    state: Arc<TerminalState>,
    port_mn: u16,
    port_cb: u16,
    acceptors: Vec<JoinHandle<()>>,
}

impl FakeTerminal {
    /// Starts both socket servers. `handler` answers each JSON request;
    /// `None` leaves the request unanswered.
    pub(crate) fn start<F>(handler: F) -> Self
    where
        F: Fn(Channel, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        let state = Arc::new(TerminalState {
            handler: Box::new(handler),
            mn: Side::default(),
            cb: Side::default(),
            stop: AtomicBool::new(false),
        });
        let (port_mn, mn) = spawn_acceptor(Channel::Mn, state.clone());
        let (port_cb, cb) = spawn_acceptor(Channel::Cb, state.clone());
        Self {
            state,
            port_mn,
            port_cb,
            acceptors: vec![mn, cb],
        }
    }

    pub(crate) fn port_mn(&self) -> u16 {
        self.port_mn
    }

    pub(crate) fn port_cb(&self) -> u16 {
        self.port_cb
    }

    /// Lines received so far on `channel`, `ping` and `quit` included.
    pub(crate) fn received(&self, channel: Channel) -> Vec<String> {
        lock(&self.state.side(channel).received).clone()
    }

    /// Writes `line` to every live connection of `channel`, waiting briefly
    /// for the first connection to be accepted.
    pub(crate) fn push(&self, channel: Channel, line: &str) {
        let side = self.state.side(channel);
        let start = Instant::now();
        while lock(&side.connections).is_empty() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(TICK);
        }
        let mut connections = lock(&side.connections);
        for stream in connections.iter_mut() {
            let _ = write_line(stream, line);
        }
    }

    /// Drops every live connection on both channels.
    pub(crate) fn kill_connections(&self) {
        for side in [&self.state.mn, &self.state.cb] {
            for stream in lock(&side.connections).drain(..) {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Drop for FakeTerminal {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.kill_connections();
        for handle in self.acceptors.drain(..) {
            let _ = handle.join();
        }
    }
}

fn write_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(line);
    stream.write_all(&bytes)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

fn spawn_acceptor(channel: Channel, state: Arc<TerminalState>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake terminal");
    let port = listener.local_addr().expect("local addr").port();
    listener.set_nonblocking(true).expect("nonblocking listener");

    let handle = thread::spawn(move || {
        while !state.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let state = state.clone();
                    thread::spawn(move || {
                        let _ = handle_connection(channel, stream, state);
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(TICK),
                Err(_) => break,
            }
        }
    });
    (port, handle)
}

fn handle_connection(
    channel: Channel,
    stream: TcpStream,
    state: Arc<TerminalState>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let side = state.side(channel);
    let mut writer = stream.try_clone()?;
    lock(&side.connections).push(stream.try_clone()?);

    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        // A timed out read keeps the partial line in `buf`.
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) if buf.last() != Some(&b'\n') => return Ok(()),
            Ok(_) => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                if state.stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let (text, _) = encoding_rs::WINDOWS_1251.decode_without_bom_handling(&buf);
        let line = text.into_owned();
        buf.clear();
        lock(&side.received).push(line.clone());

        if line == PING {
            let _guard = lock(&side.connections);
            write_line(&mut writer, PONG)?;
            continue;
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Some(response) = (state.handler)(channel, &request) {
            let _guard = lock(&side.connections);
            write_line(&mut writer, &response.to_string())?;
        }
    }
}

/// What a [`RecordingListener`] observed.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ListenerEvent {
    Open,
    Close,
    Callback(Value),
    ExceptionMn(String),
    ExceptionCb(String),
}

/// Listener that records every notification in arrival order.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<ListenerEvent> {
        lock(&self.events).clone()
    }

    /// Waits until an event matching `pred` was recorded.
    pub(crate) fn wait_for(&self, timeout: Duration, pred: impl Fn(&ListenerEvent) -> bool) -> bool {
        self.wait_for_count(timeout, 1, pred)
    }

    /// Waits until `count` events matching `pred` were recorded.
    pub(crate) fn wait_for_count(
        &self,
        timeout: Duration,
        count: usize,
        pred: impl Fn(&ListenerEvent) -> bool,
    ) -> bool {
        let start = Instant::now();
        loop {
            if lock(&self.events).iter().filter(|e| pred(e)).count() >= count {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(TICK);
        }
    }

    fn record(&self, event: ListenerEvent) {
        lock(&self.events).push(event);
    }
}

impl QuikListener for RecordingListener {
    fn on_open(&self) {
        self.record(ListenerEvent::Open);
    }

    fn on_close(&self) {
        self.record(ListenerEvent::Close);
    }

    fn on_callback(&self, frame: Value) {
        self.record(ListenerEvent::Callback(frame));
    }

    fn on_exception_mn(&self, error: QuikError) {
        self.record(ListenerEvent::ExceptionMn(error.to_string()));
    }

    fn on_exception_cb(&self, error: QuikError) {
        self.record(ListenerEvent::ExceptionCb(error.to_string()));
    }
}
