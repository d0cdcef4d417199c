//! Turns a raw drop event from the rendered queue into a validated, committed reorder.

use std::sync::Arc;

use shared::{
    domain::{GroupId, TokenId, TokenState},
    protocol::{Notification, Severity},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{AccessorError, QueueAccessor, QueueView};

/// What the drag gesture delivered. Any field may be missing when the list could not resolve
/// the element under the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropEvent {
    pub moved_id: Option<TokenId>,
    /// Group the dragged item was rendered in before the drag.
    pub source_group: Option<GroupId>,
    /// Group the item was dropped into.
    pub target_group: Option<GroupId>,
    /// Item immediately above the drop point; `None` means the top slot.
    pub previous_id: Option<TokenId>,
}

impl DropEvent {
    pub fn within(group_id: GroupId, moved_id: TokenId, previous_id: Option<TokenId>) -> Self {
        Self {
            moved_id: Some(moved_id),
            source_group: Some(group_id),
            target_group: Some(group_id),
            previous_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorderError {
    #[error("could not determine which token was dropped")]
    MissingId,
    #[error(
        "cannot move a token from group {from_group} to group {to_group}; use a transfer instead"
    )]
    CrossGroupMove { from_group: GroupId, to_group: GroupId },
    #[error("only waiting tokens can be moved (token {token_id} is {state})")]
    InvalidState { token_id: TokenId, state: TokenState },
    #[error("token {0} no longer exists")]
    NotFound(TokenId),
    #[error("could not move token {0}")]
    CommitRejected(TokenId),
    #[error("another move is still being saved")]
    Busy,
    #[error("{0}")]
    Accessor(String),
}

impl ReorderError {
    pub fn severity(&self) -> Severity {
        match self {
            ReorderError::MissingId | ReorderError::CrossGroupMove { .. } | ReorderError::Busy => {
                Severity::Warning
            }
            ReorderError::InvalidState { .. }
            | ReorderError::NotFound(_)
            | ReorderError::CommitRejected(_)
            | ReorderError::Accessor(_) => Severity::Error,
        }
    }

    /// Whether the rendered list may have drifted from the backend and must be re-fetched.
    pub fn requires_reload(&self) -> bool {
        !matches!(
            self,
            ReorderError::CrossGroupMove { .. } | ReorderError::Busy
        )
    }
}

impl From<AccessorError> for ReorderError {
    fn from(value: AccessorError) -> Self {
        match value {
            AccessorError::NotFound(token_id) => ReorderError::NotFound(token_id),
            other => ReorderError::Accessor(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderOutcome {
    Moved {
        token_id: TokenId,
        old_position: i64,
        new_position: i64,
    },
    Unchanged {
        token_id: TokenId,
        position: i64,
    },
    Failed(ReorderError),
}

/// Slot a token lands in when dropped right below a token at `previous_position`.
///
/// Moving down, the token takes the slot of the token it passed; moving up, it lands just
/// after the token it was dropped below.
pub fn target_position(old_position: i64, previous_position: i64) -> i64 {
    if old_position < previous_position {
        previous_position
    } else {
        previous_position + 1
    }
}

pub struct ReorderEngine {
    accessor: Arc<dyn QueueAccessor>,
    view: Arc<dyn QueueView>,
    in_flight: Mutex<()>,
}

impl ReorderEngine {
    pub fn new(accessor: Arc<dyn QueueAccessor>, view: Arc<dyn QueueView>) -> Self {
        Self {
            accessor,
            view,
            in_flight: Mutex::new(()),
        }
    }

    /// Handles one drop end to end. Never fails: every problem becomes a notification and,
    /// where the rendered order may be stale, a reload.
    pub async fn handle_drop(&self, event: DropEvent) -> ReorderOutcome {
        let Ok(_pending) = self.in_flight.try_lock() else {
            let error = ReorderError::Busy;
            self.report(&error).await;
            return ReorderOutcome::Failed(error);
        };

        match self.reorder(&event).await {
            Ok(outcome) => {
                if let ReorderOutcome::Moved {
                    token_id,
                    old_position,
                    new_position,
                } = outcome
                {
                    info!(
                        token_id = token_id.0,
                        old_position, new_position, "token reordered"
                    );
                    self.view.notify(Notification::new(
                        Severity::Success,
                        format!(
                            "Token moved from position {old_position} to position {new_position}"
                        ),
                    ));
                }
                self.reload().await;
                outcome
            }
            Err(error) => {
                self.report(&error).await;
                ReorderOutcome::Failed(error)
            }
        }
    }

    async fn reorder(&self, event: &DropEvent) -> Result<ReorderOutcome, ReorderError> {
        let moved_id = event.moved_id.ok_or(ReorderError::MissingId)?;

        if let (Some(from_group), Some(to_group)) = (event.source_group, event.target_group) {
            if from_group != to_group {
                return Err(ReorderError::CrossGroupMove {
                    from_group,
                    to_group,
                });
            }
        }

        let token = self.accessor.fetch_token(moved_id).await?;
        if let Some(to_group) = event.target_group {
            if token.group_id != to_group {
                return Err(ReorderError::CrossGroupMove {
                    from_group: token.group_id,
                    to_group,
                });
            }
        }
        if !token.state.is_reorderable() {
            return Err(ReorderError::InvalidState {
                token_id: moved_id,
                state: token.state,
            });
        }

        let old_position = token.position;
        let new_position = match event.previous_id {
            None => 1,
            Some(previous_id) if previous_id == moved_id => old_position,
            Some(previous_id) => match self.accessor.fetch_token(previous_id).await {
                Ok(previous) if previous.group_id == token.group_id => {
                    target_position(old_position, previous.position)
                }
                Ok(previous) => {
                    debug!(
                        previous_id = previous_id.0,
                        previous_group = previous.group_id.0,
                        "previous token belongs to another group"
                    );
                    old_position
                }
                Err(AccessorError::NotFound(_)) => old_position,
                Err(error) => return Err(error.into()),
            },
        };

        if new_position == old_position {
            debug!(token_id = moved_id.0, position = old_position, "position unchanged");
            return Ok(ReorderOutcome::Unchanged {
                token_id: moved_id,
                position: old_position,
            });
        }

        debug!(
            token_id = moved_id.0,
            old_position, new_position, "committing reorder"
        );
        if !self
            .accessor
            .commit_reorder(moved_id, new_position, old_position)
            .await?
        {
            return Err(ReorderError::CommitRejected(moved_id));
        }

        Ok(ReorderOutcome::Moved {
            token_id: moved_id,
            old_position,
            new_position,
        })
    }

    async fn report(&self, error: &ReorderError) {
        warn!(%error, "reorder failed");
        self.view
            .notify(Notification::new(error.severity(), error.to_string()));
        if error.requires_reload() {
            self.reload().await;
        }
    }

    async fn reload(&self) {
        if let Err(error) = self.view.reload().await {
            warn!(%error, "queue reload failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
