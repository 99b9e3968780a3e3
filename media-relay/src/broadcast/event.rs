use serde::Serialize;
use serde_json::Value;

use crate::job::model::JobStatus;
use crate::progress::ProgressEvent;

/// Events delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayEvent {
    Queued {
        id: String,
        message: String,
    },
    Progress {
        id: String,
        percent: f64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<ProgressEvent>,
    },
    Completed {
        id: String,
        output: Option<String>,
        message: String,
    },
    Error {
        id: String,
        message: String,
    },
    Cancelled {
        id: String,
    },
    QueueSnapshot {
        jobs: Vec<JobStatus>,
    },
    /// Outcome of an external tool self-update check.
    ToolStatus {
        tool: String,
        status: String,
        message: String,
    },
    /// Player state or diagnostics relayed from the remote-control session.
    Player {
        kind: String,
        payload: Value,
    },
}

impl RelayEvent {
    /// Job this event belongs to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Queued { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Error { id, .. }
            | Self::Cancelled { id } => Some(id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
            Self::QueueSnapshot { .. } => "queue-snapshot",
            Self::ToolStatus { .. } => "tool-status",
            Self::Player { .. } => "player",
        }
    }

    pub fn player(kind: impl Into<String>, payload: Value) -> Self {
        Self::Player {
            kind: kind.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let event = RelayEvent::Progress {
            id: "dl_1".into(),
            percent: 42.5,
            message: "Downloading".into(),
            details: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "progress", "id": "dl_1", "percent": 42.5, "message": "Downloading"})
        );

        let snapshot = serde_json::to_value(RelayEvent::QueueSnapshot { jobs: vec![] }).unwrap();
        assert_eq!(snapshot, json!({"type": "queue-snapshot", "jobs": []}));

        let tool = serde_json::to_value(RelayEvent::ToolStatus {
            tool: "yt-dlp".into(),
            status: "uptodate".into(),
            message: "yt-dlp is up to date".into(),
        })
        .unwrap();
        assert_eq!(tool["type"], "tool-status");
    }

    #[test]
    fn test_job_id() {
        assert_eq!(RelayEvent::Cancelled { id: "x".into() }.job_id(), Some("x"));
        assert_eq!(RelayEvent::player("volume", json!({})).job_id(), None);
    }
}
