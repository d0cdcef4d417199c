use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CoordinationId, CoordinationKind, GroupId, GroupState, TokenId, TokenState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    pub state: GroupState,
    pub waiting_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSummary {
    pub token_id: TokenId,
    pub group_id: GroupId,
    pub label: String,
    pub position: i64,
    pub state: TokenState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueTokenRequest {
    pub label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub new_position: i64,
    pub old_position: i64,
}

/// `accepted == false` is an ordinary rejection (stale position or concurrent change),
/// not a transport failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReorderResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetGroupStateRequest {
    pub state: GroupState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub state: TokenState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub target_group_id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEntry {
    pub entry_id: CoordinationId,
    pub token_id: TokenId,
    pub kind: CoordinationKind,
    pub from_group_id: GroupId,
    pub to_group_id: GroupId,
    pub old_position: i64,
    pub new_position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum QueueEvent {
    GroupCreated {
        group: GroupSummary,
    },
    GroupStateChanged {
        group: GroupSummary,
    },
    TokenEnqueued {
        token: TokenSummary,
    },
    TokenStateChanged {
        token_id: TokenId,
        group_id: GroupId,
        state: TokenState,
    },
    TokenReordered {
        token_id: TokenId,
        group_id: GroupId,
        old_position: i64,
        new_position: i64,
    },
    TokenTransferred {
        token_id: TokenId,
        from_group_id: GroupId,
        to_group_id: GroupId,
    },
}

impl QueueEvent {
    /// Groups whose rendered queue is stale after this event.
    pub fn affected_groups(&self) -> Vec<GroupId> {
        match self {
            QueueEvent::GroupCreated { group } | QueueEvent::GroupStateChanged { group } => {
                vec![group.group_id]
            }
            QueueEvent::TokenEnqueued { token } => vec![token.group_id],
            QueueEvent::TokenStateChanged { group_id, .. }
            | QueueEvent::TokenReordered { group_id, .. } => vec![*group_id],
            QueueEvent::TokenTransferred {
                from_group_id,
                to_group_id,
                ..
            } => vec![*from_group_id, *to_group_id],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_event_uses_tagged_wire_shape() {
        let event = QueueEvent::TokenReordered {
            token_id: TokenId(10),
            group_id: GroupId(1),
            old_position: 3,
            new_position: 1,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "token_reordered");
        assert_eq!(json["payload"]["token_id"], 10);
        assert_eq!(json["payload"]["new_position"], 1);
    }

    #[test]
    fn token_state_serializes_snake_case() {
        let json = serde_json::to_string(&TokenState::InService).expect("serialize");
        assert_eq!(json, "\"in_service\"");
        assert_eq!(TokenState::parse("in_service"), Some(TokenState::InService));
        assert_eq!(TokenState::parse("bogus"), None);
    }

    #[test]
    fn transfer_touches_both_groups() {
        let event = QueueEvent::TokenTransferred {
            token_id: TokenId(4),
            from_group_id: GroupId(1),
            to_group_id: GroupId(2),
        };
        assert_eq!(event.affected_groups(), vec![GroupId(1), GroupId(2)]);
    }
}
