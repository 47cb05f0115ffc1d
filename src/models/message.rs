//! Typed messages exchanged over the duplex client channel

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeviceInfo;

/// Commands received from a connected client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Navigate the session to a URL; the rewritten page is pushed back
    Navigate { url: String },
    /// Passthrough HTTP request; the response is pushed back with the same id
    #[serde(rename_all = "camelCase")]
    HttpRequest {
        id: String,
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    /// Client device metadata update
    DeviceInfo { payload: DeviceInfo },
    /// Liveness probe; answered with `pong`
    Ping,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Events pushed to a connected client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// First message after connect: assigned session id and spoof profile
    #[serde(rename_all = "camelCase")]
    Init { session_id: String, config: Value },
    /// Result of a `navigate` command
    #[serde(rename_all = "camelCase")]
    PageContent { url: String, content: String },
    /// Result of an `httpRequest` command
    #[serde(rename_all = "camelCase")]
    HttpResponse {
        id: String,
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// Periodic liveness push
    #[serde(rename_all = "camelCase")]
    Heartbeat { timestamp: String },
    /// Answer to a client `ping`
    Pong,
    /// Command-level failure
    Error { message: String },
}
