//! Serializable snapshots of live objects.
//!
//! Sessions, processes and forwarders hand these out for status reporting.
//! They are plain data: nothing here keeps the underlying object alive.

use serde::{Deserialize, Serialize};

/// Session metadata for tracking connection information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub connected: bool,
    pub authenticated: bool,
    /// Channels currently tracked by the session
    pub open_channels: usize,
    /// When the session object was created (RFC3339 format)
    pub created_at: String,
}

/// Lifecycle of a remote process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Command is currently running
    Running,
    /// Command finished with exit code 0, or its status was ignored
    Completed,
    /// Command failed to start, lost its channel, or exited non-zero
    Failed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Completed => write!(f, "completed"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Information about a single remote process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: String,
    pub session_id: String,
    pub command: String,
    pub status: ProcessStatus,
    /// Exit code (only present once the remote side reported one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error message (only present when failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    /// When the command was started (RFC3339 format)
    pub started_at: String,
}

/// Port forwarding snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderInfo {
    pub forwarder_id: String,
    pub session_id: String,
    /// Local listening address; absent for a paired forwarder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
    pub remote_address: String,
    pub active: bool,
    pub clients: usize,
}

/// Listening server snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub listening: bool,
    /// Sessions currently handled by a worker
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_info {
        use super::*;

        #[test]
        fn test_optional_fields_skipped() {
            let info = SessionInfo {
                session_id: "abc".to_string(),
                host: None,
                port: None,
                user: None,
                connected: false,
                authenticated: false,
                open_channels: 0,
                created_at: "2026-01-01T00:00:00Z".to_string(),
            };

            let json = serde_json::to_value(&info).unwrap();
            assert!(json.get("host").is_none());
            assert!(json.get("user").is_none());
            assert_eq!(json["open_channels"], 0);
        }
    }

    mod process_status {
        use super::*;

        #[test]
        fn test_serializes_snake_case() {
            let json = serde_json::to_string(&ProcessStatus::Completed).unwrap();
            assert_eq!(json, "\"completed\"");
            let status: ProcessStatus = serde_json::from_str("\"failed\"").unwrap();
            assert_eq!(status, ProcessStatus::Failed);
        }

        #[test]
        fn test_display() {
            assert_eq!(ProcessStatus::Running.to_string(), "running");
        }
    }

    mod process_info {
        use super::*;

        #[test]
        fn test_exit_code_present_when_known() {
            let info = ProcessInfo {
                process_id: "p".to_string(),
                session_id: "s".to_string(),
                command: "true".to_string(),
                status: ProcessStatus::Completed,
                exit_code: Some(0),
                error: None,
                stdout_bytes: 0,
                stderr_bytes: 0,
                started_at: "2026-01-01T00:00:00Z".to_string(),
            };
            let json = serde_json::to_value(&info).unwrap();
            assert_eq!(json["exit_code"], 0);
            assert!(json.get("error").is_none());
        }
    }
}
