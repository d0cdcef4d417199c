use shared::{
    domain::{GroupId, GroupState, TokenId, TokenSnapshot, TokenState},
    error::{ApiError, ErrorCode},
    protocol::{
        CoordinationEntry, GroupSummary, QueueEvent, ReorderResponse, TokenSummary,
    },
};
use storage::{Storage, StoredCoordinationEntry, StoredGroup, StoredToken};

pub const DEFAULT_LOG_LIMIT: u32 = 50;
const MAX_LOG_LIMIT: u32 = 500;
const MAX_NAME_BYTES: usize = 120;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn create_group(ctx: &ApiContext, name: &str) -> Result<GroupSummary, ApiError> {
    let name = validate_name("group name", name)?;
    let group_id = ctx.storage.create_group(name).await.map_err(internal)?;
    load_group(ctx, group_id).await.map(group_summary)
}

pub async fn list_groups(ctx: &ApiContext) -> Result<Vec<GroupSummary>, ApiError> {
    let groups = ctx.storage.list_groups().await.map_err(internal)?;
    Ok(groups.into_iter().map(group_summary).collect())
}

pub async fn set_group_state(
    ctx: &ApiContext,
    group_id: GroupId,
    state: GroupState,
) -> Result<(GroupSummary, QueueEvent), ApiError> {
    let group = ctx
        .storage
        .set_group_state(group_id, state)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "group not found"))?;
    let summary = group_summary(group);
    Ok((
        summary.clone(),
        QueueEvent::GroupStateChanged { group: summary },
    ))
}

pub async fn list_tokens(
    ctx: &ApiContext,
    group_id: GroupId,
    state: Option<TokenState>,
) -> Result<Vec<TokenSummary>, ApiError> {
    ensure_group(ctx, group_id).await?;
    let tokens = ctx
        .storage
        .list_tokens(group_id, state)
        .await
        .map_err(internal)?;
    Ok(tokens.into_iter().map(token_summary).collect())
}

pub async fn enqueue_token(
    ctx: &ApiContext,
    group_id: GroupId,
    label: &str,
) -> Result<(TokenSummary, QueueEvent), ApiError> {
    let label = validate_name("token label", label)?;
    let token = ctx
        .storage
        .enqueue_token(group_id, label)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "group not found"))?;
    let summary = token_summary(token);
    Ok((
        summary.clone(),
        QueueEvent::TokenEnqueued { token: summary },
    ))
}

pub async fn read_token(ctx: &ApiContext, token_id: TokenId) -> Result<TokenSnapshot, ApiError> {
    load_token(ctx, token_id).await.map(|token| token.snapshot())
}

/// The accessor commit. A rejected move is a normal `accepted: false` answer, only malformed
/// input or an unknown token is an error.
pub async fn reorder_token(
    ctx: &ApiContext,
    token_id: TokenId,
    new_position: i64,
    old_position: i64,
) -> Result<(ReorderResponse, Option<QueueEvent>), ApiError> {
    if new_position < 1 || old_position < 1 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "positions must be positive",
        ));
    }
    let token = load_token(ctx, token_id).await?;
    let accepted = ctx
        .storage
        .reorder_token(token_id, new_position, old_position)
        .await
        .map_err(internal)?;

    let event = (accepted && new_position != old_position).then_some(QueueEvent::TokenReordered {
        token_id,
        group_id: token.group_id,
        old_position,
        new_position,
    });
    Ok((ReorderResponse { accepted }, event))
}

pub async fn set_token_state(
    ctx: &ApiContext,
    token_id: TokenId,
    state: TokenState,
) -> Result<(TokenSummary, QueueEvent), ApiError> {
    let token = ctx
        .storage
        .set_token_state(token_id, state)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "token not found"))?;
    let event = QueueEvent::TokenStateChanged {
        token_id,
        group_id: token.group_id,
        state: token.state,
    };
    Ok((token_summary(token), event))
}

pub async fn transfer_token(
    ctx: &ApiContext,
    token_id: TokenId,
    target_group_id: GroupId,
    reason: Option<&str>,
) -> Result<(ReorderResponse, Option<QueueEvent>), ApiError> {
    let token = load_token(ctx, token_id).await?;
    let target = load_group(ctx, target_group_id).await?;
    if !target.state.accepts_transfers() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("target group is {}", target.state),
        ));
    }
    if token.group_id == target_group_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "token already belongs to the target group",
        ));
    }

    let accepted = ctx
        .storage
        .transfer_token(token_id, target_group_id, reason)
        .await
        .map_err(internal)?;
    let event = accepted.then_some(QueueEvent::TokenTransferred {
        token_id,
        from_group_id: token.group_id,
        to_group_id: target_group_id,
    });
    Ok((ReorderResponse { accepted }, event))
}

pub async fn coordination_log(
    ctx: &ApiContext,
    group_id: GroupId,
    limit: Option<u32>,
) -> Result<Vec<CoordinationEntry>, ApiError> {
    ensure_group(ctx, group_id).await?;
    let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let entries = ctx
        .storage
        .coordination_log(group_id, limit)
        .await
        .map_err(internal)?;
    Ok(entries.into_iter().map(coordination_entry).collect())
}

async fn load_token(ctx: &ApiContext, token_id: TokenId) -> Result<StoredToken, ApiError> {
    ctx.storage
        .read_token(token_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "token not found"))
}

async fn load_group(ctx: &ApiContext, group_id: GroupId) -> Result<StoredGroup, ApiError> {
    ctx.storage
        .load_group(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "group not found"))
}

async fn ensure_group(ctx: &ApiContext, group_id: GroupId) -> Result<(), ApiError> {
    load_group(ctx, group_id).await.map(|_| ())
}

fn validate_name<'a>(what: &str, raw: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{what} cannot be empty"),
        ));
    }
    if trimmed.len() > MAX_NAME_BYTES {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{what} exceeds {MAX_NAME_BYTES} bytes"),
        ));
    }
    Ok(trimmed)
}

fn group_summary(group: StoredGroup) -> GroupSummary {
    GroupSummary {
        group_id: group.group_id,
        name: group.name,
        state: group.state,
        waiting_count: group.waiting_count,
    }
}

fn token_summary(token: StoredToken) -> TokenSummary {
    TokenSummary {
        token_id: token.token_id,
        group_id: token.group_id,
        label: token.label,
        position: token.position,
        state: token.state,
        created_at: token.created_at,
    }
}

fn coordination_entry(entry: StoredCoordinationEntry) -> CoordinationEntry {
    CoordinationEntry {
        entry_id: entry.entry_id,
        token_id: entry.token_id,
        kind: entry.kind,
        from_group_id: entry.from_group_id,
        to_group_id: entry.to_group_id,
        old_position: entry.old_position,
        new_position: entry.new_position,
        reason: entry.reason,
        created_at: entry.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
