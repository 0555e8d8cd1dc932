use crate::errors::QuikError;

use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Where and as whom the bridge connects to the terminal.
///
/// Read from a JSON object of the form
/// `{"host": "127.0.0.1", "portMN": 10001, "portCB": 10002, "clientId": "bot"}`.
/// Unknown keys are ignored so the object may be a section of a larger config.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct QuikConfig {
    /// Terminal host name or address.
    pub host: String,
    /// Port of the main (MN) socket server.
    #[serde(rename = "portMN")]
    pub port_mn: u16,
    /// Port of the callback (CB) socket server.
    #[serde(rename = "portCB")]
    pub port_cb: u16,
    /// Identifier sent with every request.
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl QuikConfig {
    /// Builds a config from an already parsed JSON object.
    pub fn from_json(value: &Value) -> Result<Self, QuikError> {
        Self::deserialize(value).map_err(|e| QuikError::InvalidConfig(e.to_string()))
    }

    /// Loads a config from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QuikError> {
        log::info!("Loading bridge configuration from: {:?}", path.as_ref());
        let file = File::open(&path).map_err(|e| QuikError::InvalidConfig(e.to_string()))?;
        let value: Value = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| QuikError::InvalidConfig(e.to_string()))?;
        let config = Self::from_json(&value)?;
        log::info!(
            "Bridge configured for {} (MN {}, CB {}) as client {:?}",
            config.host,
            config.port_mn,
            config.port_cb,
            config.client_id
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_json_valid() {
        let config = QuikConfig::from_json(&json!({
            "host": "127.0.0.1",
            "portMN": 10001,
            "portCB": 10002,
            "clientId": "t",
            "extra": [1, 2, 3],
        }))
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port_mn, 10001);
        assert_eq!(config.port_cb, 10002);
        assert_eq!(config.client_id, "t");
    }

    #[test]
    fn test_from_json_missing_key() {
        let result = QuikConfig::from_json(&json!({
            "host": "127.0.0.1",
            "portMN": 10001,
            "clientId": "t",
        }));
        match result {
            Err(QuikError::InvalidConfig(msg)) => assert!(msg.contains("portCB")),
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_wrong_type() {
        let result = QuikConfig::from_json(&json!({
            "host": "127.0.0.1",
            "portMN": "10001",
            "portCB": 10002,
            "clientId": "t",
        }));
        assert!(matches!(result, Err(QuikError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_file_valid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"host": "localhost", "portMN": 34130, "portCB": 34131, "clientId": "bot"}}"#
        )
        .unwrap();

        let config = QuikConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port_cb, 34131);
    }

    #[test]
    fn test_from_file_invalid() {
        let result = QuikConfig::from_file("nonexistent_config.json");
        match result.unwrap_err() {
            QuikError::InvalidConfig(_) => {}
            _ => panic!("Expected InvalidConfig error"),
        }
    }
}
