//! # QUIK Bridge
//!
//! Client side of the socket bridge to the QUIK trading terminal.
//!
//! The terminal runs two line-oriented socket servers: **MN** for plain
//! request/response traffic and **CB** for request/response traffic plus
//! pushed callbacks. Both speak single-line JSON frames in the CP1251 code
//! page.
//!
//! ## Features
//!
//! - Keeps both sockets open, sends `ping` every 15 s and reconnects after
//!   failures with a cool-down.
//! - Correlates responses with requests through a process-wide id counter.
//! - Enforces per-request deadlines; late responses are dropped.
//! - Delivers callbacks to a listener that must not block.
//! - Ships a session manager that checks the terminal and keeps callback
//!   and market-data subscriptions alive across reconnects.
//!
//! ## Architecture Overview
//!
//! - [`socket`](crate::socket): line-framed TCP connector with CP1251 encoding.
//! - [`frames`](crate::frames): outbound frame encoding, inbound frame classification.
//! - [`response`](crate::response): response futures and the pending-response table.
//! - [`quik_connect`](crate::quik_connect): the transport and its listening thread.
//! - [`listener`](crate::listener): listener contract and the task queue.
//! - [`simple_listener`](crate::simple_listener): the session manager.
//! - [`requests`](crate::requests): script templates for market-data requests.
//! - [`class_sec_code`](crate::class_sec_code): instrument identity.
//! - [`config`](crate::config): connection settings.
//! - [`defs`](crate::defs): shared constants and default timings.
//! - [`errors`](crate::errors): error types used across modules.
//! - [`logger`](crate::logger): `env_logger` setup for the binaries.
//!
//! ## Threads
//!
//! The transport owns one listening thread that reads both sockets and calls
//! the listener. The session manager lives on an application thread that
//! periodically calls [`SimpleQuikListener::step`](crate::simple_listener::SimpleQuikListener::step);
//! listener notifications reach it as queued tasks. Requests may be
//! submitted from any thread.
//!
//! ## Example
//!
//! ```no_run
//! use quik_bridge::quik_connect::QuikConnect;
//! use quik_bridge::simple_listener::SimpleQuikListener;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = SimpleQuikListener::new();
//!     let config = json!({"host": "127.0.0.1", "portMN": 10001, "portCB": 10002, "clientId": "bot"});
//!     let quik = Arc::new(QuikConnect::from_config(&config, session.listener())?);
//!     session.set_quik_connect(quik.clone());
//!     quik.start()?;
//!
//!     let max = quik.execute_mn_fn("math.max", vec![json!(1), json!(7)], Duration::from_secs(5))?;
//!     println!("{}", max["result"]);
//!
//!     quik.shutdown();
//!     session.process_tasks();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

pub mod class_sec_code;
pub mod config;
pub mod defs;
pub mod errors;
pub mod frames;
pub mod listener;
pub mod logger;
pub mod quik_connect;
pub mod requests;
pub mod response;
pub mod simple_listener;
pub mod socket;

#[cfg(test)]
mod fake_terminal;
