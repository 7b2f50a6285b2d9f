//! Cursor position wire types shared by the server and its clients.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The last known cursor/viewport position of one session member.
///
/// Serialized in camelCase on every wire: WebSocket frames, the backplane
/// position channel and the persisted session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    pub member_id: i64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub location: String,
    /// Unix epoch milliseconds at which the server received the update.
    #[serde(default)]
    pub updated_at: i64,
}

/// Position message sent by a member over its connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub location: String,
}

impl PositionUpdate {
    /// Attribute the update to a member, stamping it with the current time.
    pub fn into_state(self, member_id: i64) -> PositionState {
        self.into_state_at(member_id, Utc::now().timestamp_millis())
    }

    pub fn into_state_at(self, member_id: i64, updated_at: i64) -> PositionState {
        PositionState {
            member_id,
            x: self.x,
            y: self.y,
            selector: self.selector,
            location: self.location,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_state_uses_camel_case() {
        let state = PositionState {
            member_id: 7,
            x: 1.5,
            y: 2.0,
            selector: "#a".into(),
            location: "/p".into(),
            updated_at: 42,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["memberId"], 7);
        assert_eq!(json["updatedAt"], 42);
        assert_eq!(json["selector"], "#a");
    }

    #[test]
    fn update_tolerates_missing_selector() {
        let update: PositionUpdate = serde_json::from_str(r#"{"x":-1,"y":-1}"#).unwrap();
        assert!(update.selector.is_empty());
        assert!(update.location.is_empty());
    }

    #[test]
    fn into_state_stamps_member_and_time() {
        let update = PositionUpdate {
            x: 10.0,
            y: 20.0,
            selector: "#a".into(),
            location: "/p".into(),
        };
        let before = Utc::now().timestamp_millis();
        let state = update.into_state(3);
        assert_eq!(state.member_id, 3);
        assert!(state.updated_at >= before);
    }
}
