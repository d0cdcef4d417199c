use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(TokenId);
id_newtype!(GroupId);
id_newtype!(CoordinationId);

/// Lifecycle state of a queued token. Only `Waiting` tokens can be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Waiting,
    InService,
    Done,
    Skipped,
}

impl TokenState {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Waiting => "waiting",
            TokenState::InService => "in_service",
            TokenState::Done => "done",
            TokenState::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(TokenState::Waiting),
            "in_service" => Some(TokenState::InService),
            "done" => Some(TokenState::Done),
            "skipped" => Some(TokenState::Skipped),
            _ => None,
        }
    }

    pub fn is_reorderable(self) -> bool {
        self == TokenState::Waiting
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating status of a group (room). Tokens can only be transferred into an open group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Open,
    Closed,
    Maintenance,
}

impl GroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupState::Open => "open",
            GroupState::Closed => "closed",
            GroupState::Maintenance => "maintenance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(GroupState::Open),
            "closed" => Some(GroupState::Closed),
            "maintenance" => Some(GroupState::Maintenance),
            _ => None,
        }
    }

    pub fn accepts_transfers(self) -> bool {
        self == GroupState::Open
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationKind {
    PositionChange,
    RoomChange,
}

impl CoordinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinationKind::PositionChange => "position_change",
            CoordinationKind::RoomChange => "room_change",
        }
    }
}

/// The slice of a token the reorder engine reads before deciding on a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub position: i64,
    pub state: TokenState,
    pub group_id: GroupId,
}
