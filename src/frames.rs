//! Wire frames exchanged with the terminal.
//!
//! Outbound frames are single-line JSON objects carrying a request id, the
//! client id and one payload shape:
//!
//! - chunk: `{"id":1,"clientId":"bot","chunk":"return os.sysdate()"}`
//! - function: `{"id":2,"clientId":"bot","fname":"math.max","args":[1,3]}`
//! - callback subscription (CB only): `{"id":3,"clientId":"bot","callback":"OnTrade","filter":"*"}`
//!
//! Inbound lines are either the literal `pong`, a response carrying an integer
//! `id`, or (on CB only) a callback frame carrying a string `callback`.

use crate::defs::PONG;
use crate::errors::{Channel, QuikError};

use serde::Serialize;
use serde_json::Value;

/// Payload of an outbound request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Script fragment evaluated by the terminal.
    Chunk {
        /// Source text of the fragment.
        chunk: String,
    },
    /// Named function call with positional arguments.
    Function {
        /// Function name, e.g. `"isConnected"` or `"math.max"`.
        fname: String,
        /// Positional arguments. Always rendered as an array.
        args: Vec<Value>,
    },
    /// Subscription to a server-side event. Valid on the CB channel only.
    Callback {
        /// Event name, e.g. `"OnAllTrade"`.
        callback: String,
        /// Script-level filter; `"*"` accepts every event.
        filter: String,
    },
}

impl Payload {
    /// Chunk payload.
    pub fn chunk(chunk: impl Into<String>) -> Self {
        Payload::Chunk {
            chunk: chunk.into(),
        }
    }

    /// Function-call payload.
    pub fn function(fname: impl Into<String>, args: Vec<Value>) -> Self {
        Payload::Function {
            fname: fname.into(),
            args,
        }
    }

    /// Callback-subscription payload.
    pub fn callback(callback: impl Into<String>, filter: impl Into<String>) -> Self {
        Payload::Callback {
            callback: callback.into(),
            filter: filter.into(),
        }
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Payload::Chunk { chunk } => format!("chunk of {} bytes", chunk.len()),
            Payload::Function { fname, args } => format!("{}({} args)", fname, args.len()),
            Payload::Callback { callback, .. } => format!("callback {}", callback),
        }
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    id: u64,
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(flatten)]
    payload: &'a Payload,
}

/// Renders one outbound frame as a single JSON line (without the terminator).
///
/// Every string is JSON-escaped, so the result never contains a raw newline.
///
/// ```
/// use quik_bridge::frames::{encode, Payload};
/// let line = encode(7, "bot", &Payload::chunk("return 1")).unwrap();
/// assert_eq!(line, r#"{"id":7,"clientId":"bot","chunk":"return 1"}"#);
/// ```
pub fn encode(id: u64, client_id: &str, payload: &Payload) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame {
        id,
        client_id,
        payload,
    })
}

/// A classified inbound line.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Keep-alive reply.
    Pong,
    /// Pushed event (CB channel only).
    Callback {
        /// Value of the `callback` field.
        name: String,
        /// The whole frame.
        frame: Value,
    },
    /// Response to the request with this id.
    Response {
        /// Value of the integer `id` field.
        id: u64,
        /// The whole frame.
        frame: Value,
    },
    /// A JSON object that is neither; dropped by the transport.
    Unrouted(Value),
}

/// Classifies a line received on `channel`.
///
/// Malformed JSON yields [`QuikError::Parse`], JSON that is not an object
/// yields [`QuikError::UnexpectedFrame`]. Only integer ids are routed as
/// responses; `callback` fields are honoured on the CB channel only.
pub fn classify(channel: Channel, line: &str) -> Result<Inbound, QuikError> {
    if line == PONG {
        return Ok(Inbound::Pong);
    }
    let frame: Value = serde_json::from_str(line).map_err(|source| QuikError::Parse {
        channel,
        line: line.to_string(),
        source,
    })?;
    if !frame.is_object() {
        return Err(QuikError::UnexpectedFrame {
            channel,
            reason: format!("expected a JSON object, got {}", frame),
        });
    }
    if channel == Channel::Cb {
        if let Some(name) = frame.get("callback").and_then(Value::as_str) {
            return Ok(Inbound::Callback {
                name: name.to_string(),
                frame,
            });
        }
    }
    match frame.get("id").and_then(Value::as_u64) {
        Some(id) => Ok(Inbound::Response { id, frame }),
        None => Ok(Inbound::Unrouted(frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_function_frame() {
        let line = encode(
            12,
            "t",
            &Payload::function("math.max", vec![json!(1), json!(3), json!(5), json!(7)]),
        )
        .unwrap();
        assert_eq!(
            line,
            r#"{"id":12,"clientId":"t","fname":"math.max","args":[1,3,5,7]}"#
        );
    }

    #[test]
    fn test_encode_function_without_args() {
        let line = encode(1, "t", &Payload::function("isConnected", vec![])).unwrap();
        assert_eq!(line, r#"{"id":1,"clientId":"t","fname":"isConnected","args":[]}"#);
    }

    #[test]
    fn test_encode_escapes_every_string() {
        let chunk = "message(\"Hi\")\nreturn 1";
        let line = encode(3, "bot \"one\"", &Payload::chunk(chunk)).unwrap();
        assert!(!line.contains('\n'));

        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["chunk"], chunk);
        assert_eq!(parsed["clientId"], "bot \"one\"");
        assert_eq!(parsed["id"], 3);
    }

    #[test]
    fn test_encode_callback_frame() {
        let filter = "function(t) return t.sec_code == \"AFLT\" end";
        let line = encode(4, "t", &Payload::callback("OnAllTrade", filter)).unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["callback"], "OnAllTrade");
        assert_eq!(parsed["filter"], filter);
        assert!(line.starts_with(r#"{"id":4,"clientId":"t","callback":"#));
    }

    #[test]
    fn test_classify_pong_and_response() {
        assert_eq!(classify(Channel::Mn, "pong").unwrap(), Inbound::Pong);
        match classify(Channel::Mn, r#"{"id":9,"result":7}"#).unwrap() {
            Inbound::Response { id, frame } => {
                assert_eq!(id, 9);
                assert_eq!(frame["result"], 7);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_callback_only_on_cb() {
        let line = r#"{"callback":"OnAllTrade","arg1":{"price":1.5}}"#;
        match classify(Channel::Cb, line).unwrap() {
            Inbound::Callback { name, frame } => {
                assert_eq!(name, "OnAllTrade");
                assert_eq!(frame["arg1"]["price"], 1.5);
            }
            other => panic!("Expected callback, got {:?}", other),
        }
        assert!(matches!(
            classify(Channel::Mn, line).unwrap(),
            Inbound::Unrouted(_)
        ));
    }

    #[test]
    fn test_classify_non_integer_id_is_unrouted() {
        assert!(matches!(
            classify(Channel::Mn, r#"{"id":"9","result":1}"#).unwrap(),
            Inbound::Unrouted(_)
        ));
        assert!(matches!(
            classify(Channel::Mn, r#"{"id":9.5,"result":1}"#).unwrap(),
            Inbound::Unrouted(_)
        ));
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify(Channel::Cb, "{not json"),
            Err(QuikError::Parse {
                channel: Channel::Cb,
                ..
            })
        ));
        assert!(matches!(
            classify(Channel::Mn, "[1,2]"),
            Err(QuikError::UnexpectedFrame {
                channel: Channel::Mn,
                ..
            })
        ));
    }
}
