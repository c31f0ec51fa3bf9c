use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{KoraId, PluginState, ToolCallStatus, ToolSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KoraEvent {
    pub id: KoraId,
    pub trace_id: KoraId,
    pub timestamp: DateTime<Utc>,
    pub data: KoraEventData,
}

impl KoraEvent {
    pub fn new(data: KoraEventData) -> Self {
        Self::with_trace(KoraId::new_trace_id(), data)
    }

    pub fn with_trace(trace_id: KoraId, data: KoraEventData) -> Self {
        Self {
            id: KoraId::new(),
            trace_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum KoraEventData {
    SessionCreated {
        session_id: KoraId,
        user_id: String,
    },
    SessionUpdated {
        session_id: KoraId,
    },
    SessionDeleted {
        session_id: KoraId,
        permanent: bool,
    },
    MessageAppended {
        session_id: KoraId,
        message_id: KoraId,
    },
    ContentDropped {
        session_id: KoraId,
        index: usize,
        reason: String,
    },
    ToolCallStarted {
        session_id: KoraId,
        tool_call_id: String,
        name: String,
    },
    ToolCallFinished {
        session_id: KoraId,
        tool_call_id: String,
        status: ToolCallStatus,
        duration_ms: u64,
    },
    PluginStateChanged {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },
    PluginCircuitOpened {
        plugin_id: String,
        consecutive_failures: u32,
    },
    McpServerConnected {
        server_id: String,
        tool_count: usize,
    },
    McpServerDisconnected {
        server_id: String,
    },
    McpToolDiscovered {
        server_id: String,
        tool: ToolSpec,
    },
    McpServerError {
        server_id: String,
        message: String,
    },
}
