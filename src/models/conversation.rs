use serde::Serialize;

/// Durable conversation record. The in-memory membership the Hub tracks is
/// separate from the participant rows attached to this.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRow {
    pub id: String,
    /// "direct" or "group"
    pub kind: String,
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub last_message_id: Option<String>,
    pub created_at: String,
}
