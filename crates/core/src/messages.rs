//! Control-plane message payloads.
//!
//! All control traffic is JSON over a topic-based pub/sub transport.
//! Limits in start messages are whole megabytes; the agent converts them
//! to bytes before they reach the backend.

use serde::{Deserialize, Serialize};

/// Subject carrying task start commands.
pub const START_SUBJECT: &str = "task.start";
/// Subject carrying task stop commands.
pub const STOP_SUBJECT: &str = "task.stop";
/// Subject the agent publishes capacity advertisements on.
pub const ADVERTISE_SUBJECT: &str = "task.advertise";

/// Start command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMessage {
    #[serde(alias = "session")]
    pub task: String,
    #[serde(default)]
    pub secure_token: String,
    /// Memory limit in whole megabytes; zero means unset.
    #[serde(default)]
    pub memory_limit: u64,
    /// Disk limit in whole megabytes; zero means unset.
    #[serde(default)]
    pub disk_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Stop command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopMessage {
    #[serde(alias = "session")]
    pub task: String,
}

/// Periodic capacity advertisement, in whole megabytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: String,
    pub available_memory: u64,
    pub available_disk: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_message_decodes() {
        let msg: StartMessage = serde_json::from_str(
            r#"{"task":"t1","secure_token":"tok","memory_limit":32,"disk_limit":1}"#,
        )
        .unwrap();
        assert_eq!(msg.task, "t1");
        assert_eq!(msg.secure_token, "tok");
        assert_eq!(msg.memory_limit, 32);
        assert_eq!(msg.disk_limit, 1);
        assert!(msg.public_key.is_none());
    }

    #[test]
    fn start_message_accepts_session_alias() {
        let msg: StartMessage =
            serde_json::from_str(r#"{"session":"s1","secure_token":"t"}"#).unwrap();
        assert_eq!(msg.task, "s1");
        assert_eq!(msg.memory_limit, 0);
    }

    #[test]
    fn malformed_start_message_is_an_error() {
        assert!(serde_json::from_str::<StartMessage>("not json").is_err());
        assert!(serde_json::from_str::<StartMessage>(r#"{"memory_limit":1}"#).is_err());
    }
}
