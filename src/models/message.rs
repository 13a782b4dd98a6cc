use serde::{Deserialize, Serialize};

/// Persisted message row. `created_at` is milliseconds since the UNIX epoch
/// and is the canonical timestamp carried by broadcast envelopes.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub created_at: i64,
}

/// Content of a message to persist. At least one field must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub text: Option<String>,
    pub url: Option<String>,
    pub file_name: Option<String>,
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.url.is_none() && self.file_name.is_none()
    }
}
