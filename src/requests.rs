//! Script templates evaluated by the terminal as MN chunks.
//!
//! Each template renders a script fragment that returns a value of a known
//! shape. Templates never perform I/O; send them with
//! [`QuikConnect::submit_mn_chunk`](crate::quik_connect::QuikConnect::submit_mn_chunk)
//! or through [`QuikRequest::payload`].

use crate::class_sec_code::ClassSecCode;
use crate::frames::Payload;

use std::fmt::Write;

/// A script fragment for the terminal.
pub trait QuikRequest {
    /// Renders the fragment.
    fn request(&self) -> String;

    /// The fragment as a chunk payload.
    fn payload(&self) -> Payload {
        Payload::chunk(self.request())
    }
}

/// Quotes `s` as a script string literal.
fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `class, sec` argument pair.
fn instrument_args(instrument: &ClassSecCode) -> String {
    format!(
        "{}, {}",
        lua_string(instrument.class_code()),
        lua_string(instrument.sec_code())
    )
}

/// Last `max_size` candles of one interval. Returns the terminal's candle table.
#[derive(Clone, Debug)]
pub struct CandlesRequest {
    instrument: ClassSecCode,
    interval: u32,
    max_size: u32,
}

impl CandlesRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode, interval: u32, max_size: u32) -> Self {
        Self {
            instrument,
            interval,
            max_size,
        }
    }
}

impl QuikRequest for CandlesRequest {
    fn request(&self) -> String {
        format!(
            "return getCandles({}, {}, {})",
            instrument_args(&self.instrument),
            self.interval,
            self.max_size
        )
    }
}

/// Opens a candle data source per interval.
///
/// Returns `{classCode, secCode, [interval] = "ok" | error}`.
#[derive(Clone, Debug)]
pub struct CandlesSubscriptionRequest {
    instrument: ClassSecCode,
    intervals: Vec<u32>,
}

impl CandlesSubscriptionRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode, intervals: Vec<u32>) -> Self {
        Self {
            instrument,
            intervals,
        }
    }
}

impl QuikRequest for CandlesSubscriptionRequest {
    fn request(&self) -> String {
        let args = instrument_args(&self.instrument);
        let mut script = format!(
            "local t = {{ classCode = {}, secCode = {}, }}\n",
            lua_string(self.instrument.class_code()),
            lua_string(self.instrument.sec_code())
        );
        for interval in &self.intervals {
            let _ = writeln!(
                script,
                "t[{}] = initDataSource({}, {})",
                interval, args, interval
            );
        }
        script.push_str("return t\n");
        script
    }
}

/// Current values of trading-table parameters.
///
/// Returns `{param = value}` for every parameter the terminal knows.
#[derive(Clone, Debug)]
pub struct GetParamExRequest {
    instrument: ClassSecCode,
    parameters: Vec<String>,
}

impl GetParamExRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode, parameters: Vec<String>) -> Self {
        Self {
            instrument,
            parameters,
        }
    }
}

impl QuikRequest for GetParamExRequest {
    fn request(&self) -> String {
        let args = instrument_args(&self.instrument);
        let mut script = String::from("local t = {}\nlocal p\n");
        for param in &self.parameters {
            let param = lua_string(param);
            let _ = writeln!(script, "p = getParamEx({}, {})", args, param);
            script.push_str("if type(p) == \"table\" and p.result == \"1\" then\n");
            let _ = writeln!(script, "  t[{}] = p.param_value", param);
            script.push_str("end\n");
        }
        script.push_str("return t");
        script
    }
}

/// Orders parameter updates for an instrument. Returns a boolean.
#[derive(Clone, Debug)]
pub struct ParamSubscriptionRequest {
    instrument: ClassSecCode,
    parameters: Vec<String>,
}

impl ParamSubscriptionRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode, parameters: Vec<String>) -> Self {
        Self {
            instrument,
            parameters,
        }
    }
}

impl QuikRequest for ParamSubscriptionRequest {
    fn request(&self) -> String {
        let args = instrument_args(&self.instrument);
        let mut script = String::from("local b = false\n");
        for param in &self.parameters {
            let _ = writeln!(
                script,
                "b = b or ParamRequest({}, {})",
                args,
                lua_string(param)
            );
        }
        // Reading each parameter once primes the terminal's cache.
        for param in &self.parameters {
            let _ = writeln!(script, "getParamEx({}, {})", args, lua_string(param));
        }
        script.push_str("return b\n");
        script
    }
}

/// Current order book of an instrument.
#[derive(Clone, Debug)]
pub struct Level2QuotesRequest {
    instrument: ClassSecCode,
}

impl Level2QuotesRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode) -> Self {
        Self { instrument }
    }
}

impl QuikRequest for Level2QuotesRequest {
    fn request(&self) -> String {
        format!("return getQuoteLevel2({})", instrument_args(&self.instrument))
    }
}

/// Orders order-book updates for an instrument. Returns a boolean.
#[derive(Clone, Debug)]
pub struct Level2QuotesSubscriptionRequest {
    instrument: ClassSecCode,
}

impl Level2QuotesSubscriptionRequest {
    /// Creates the request.
    pub fn new(instrument: ClassSecCode) -> Self {
        Self { instrument }
    }
}

impl QuikRequest for Level2QuotesSubscriptionRequest {
    fn request(&self) -> String {
        format!(
            "return Subscribe_Level_II_Quotes({})",
            instrument_args(&self.instrument)
        )
    }
}

fn bulk_request(instruments: &[ClassSecCode], field: &str, function: &str) -> String {
    let mut script = String::from("return {\n");
    for (i, instrument) in instruments.iter().enumerate() {
        let _ = writeln!(
            script,
            "  [{}] = {{ classCode = {}, secCode = {}, {} = {}({}), }},",
            i + 1,
            lua_string(instrument.class_code()),
            lua_string(instrument.sec_code()),
            field,
            function,
            instrument_args(instrument)
        );
    }
    script.push('}');
    script
}

/// Order books of several instruments.
///
/// Returns `[{classCode, secCode, quotes}]` in the given order.
#[derive(Clone, Debug)]
pub struct BulkLevel2QuotesRequest {
    instruments: Vec<ClassSecCode>,
}

impl BulkLevel2QuotesRequest {
    /// Creates the request.
    pub fn new(instruments: Vec<ClassSecCode>) -> Self {
        Self { instruments }
    }
}

impl QuikRequest for BulkLevel2QuotesRequest {
    fn request(&self) -> String {
        bulk_request(&self.instruments, "quotes", "getQuoteLevel2")
    }
}

/// Orders order-book updates for several instruments.
///
/// Returns `[{classCode, secCode, subscribed}]` in the given order.
#[derive(Clone, Debug)]
pub struct BulkLevel2QuotesSubscriptionRequest {
    instruments: Vec<ClassSecCode>,
}

impl BulkLevel2QuotesSubscriptionRequest {
    /// Creates the request.
    pub fn new(instruments: Vec<ClassSecCode>) -> Self {
        Self { instruments }
    }
}

impl QuikRequest for BulkLevel2QuotesSubscriptionRequest {
    fn request(&self) -> String {
        bulk_request(
            &self.instruments,
            "subscribed",
            "Subscribe_Level_II_Quotes",
        )
    }
}
