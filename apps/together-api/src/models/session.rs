use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a shared browsing session, as kept by the session directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub base_location: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: String, name: String, creator: String, base_location: String) -> Self {
        Self {
            id,
            name,
            creator,
            base_location,
            created_at: Utc::now(),
        }
    }

    /// WebSocket URL members connect to, relative to a public origin.
    pub fn join_url(&self, ws_base: &str) -> String {
        format!("{}/ws/{}/cursors", ws_base.trim_end_matches('/'), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_trims_trailing_slash() {
        let record = SessionRecord::new("ses_1".into(), "n".into(), "c".into(), "/".into());
        assert_eq!(
            record.join_url("wss://api.example.com/"),
            "wss://api.example.com/ws/ses_1/cursors"
        );
    }

    #[test]
    fn records_without_timestamp_still_decode() {
        let json = r#"{"id":"x","name":"n","creator":"c","baseLocation":"https://a"}"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.base_location, "https://a");
    }
}
