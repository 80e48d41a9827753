//! Session configuration payload sent during negotiation

use serde::{Deserialize, Serialize};

use crate::remote::{Remote, RemoteSet};
use crate::{ProtoError, PROTOCOL_VERSION};

/// Payload of the `config` control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionConfig {
    pub version: String,
    pub remotes: Vec<Remote>,
}

impl SessionConfig {
    pub fn new(remotes: &RemoteSet) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            remotes: remotes.as_slice().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_wire_shape() {
        let remotes = RemoteSet::decode(["R:2222:localhost:22"]).unwrap();
        let encoded = SessionConfig::new(&remotes).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["Version"], "burrow-v1");
        let remote = &json["Remotes"][0];
        assert_eq!(remote["Reverse"], true);
        assert_eq!(remote["LocalPort"], 2222);
        assert_eq!(remote["RemoteHost"], "localhost");
        assert_eq!(remote["RemoteProto"], "tcp");
    }

    #[test]
    fn test_session_config_is_stable_across_attempts() {
        let remotes = RemoteSet::decode(["3000", "socks"]).unwrap();
        let first = SessionConfig::new(&remotes).encode().unwrap();
        let second = SessionConfig::new(&remotes).encode().unwrap();
        assert_eq!(first, second);
        assert_eq!(SessionConfig::decode(&first).unwrap().remotes.len(), 2);
    }

    #[test]
    fn test_session_config_decode_rejects_garbage() {
        assert!(matches!(
            SessionConfig::decode(b"not json"),
            Err(ProtoError::InvalidConfig(_))
        ));
    }
}
