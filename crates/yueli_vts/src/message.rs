//! Wire format of the VTube Studio public API.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const API_NAME: &str = "VTubeStudioPublicAPI";
pub const API_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VtsRequest {
    pub api_name: &'static str,
    pub api_version: &'static str,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub message_type: &'static str,
    pub data: Value,
}

impl VtsRequest {
    fn new(message_type: &'static str, data: Value) -> Self {
        Self {
            api_name: API_NAME,
            api_version: API_VERSION,
            request_id: Uuid::new_v4().to_string(),
            message_type,
            data,
        }
    }

    pub fn token(plugin_name: &str, plugin_developer: &str) -> Self {
        Self::new(
            "AuthenticationTokenRequest",
            json!({ "pluginName": plugin_name, "pluginDeveloper": plugin_developer }),
        )
    }

    pub fn authenticate(plugin_name: &str, plugin_developer: &str, token: &str) -> Self {
        Self::new(
            "AuthenticationRequest",
            json!({
                "pluginName": plugin_name,
                "pluginDeveloper": plugin_developer,
                "authenticationToken": token,
            }),
        )
    }

    pub fn hotkey(hotkey: &str) -> Self {
        Self::new("HotkeyTriggerRequest", json!({ "hotkeyID": hotkey }))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VtsResponse {
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

impl VtsResponse {
    pub fn is_error(&self) -> bool {
        self.message_type == "APIError"
    }

    /// Error text of an `APIError` response.
    pub fn error_message(&self) -> String {
        let id = self.data.get("errorID").and_then(Value::as_i64).unwrap_or_default();
        let message = self.data.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        format!("{} (error {})", message, id)
    }

    pub fn issued_token(&self) -> Option<&str> {
        self.data.get("authenticationToken").and_then(Value::as_str)
    }

    pub fn authenticated(&self) -> bool {
        self.data.get("authenticated").and_then(Value::as_bool).unwrap_or(false)
    }
}
