use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    collections::HashMap,
    fs,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::Mutex as AsyncMutex;

use shared::domain::{
    CoordinationId, CoordinationKind, GroupId, GroupState, TokenId, TokenSnapshot, TokenState,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    group_locks: Arc<Mutex<HashMap<GroupId, Arc<AsyncMutex<()>>>>>,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub group_id: GroupId,
    pub name: String,
    pub state: GroupState,
    pub waiting_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredToken {
    pub token_id: TokenId,
    pub group_id: GroupId,
    pub label: String,
    pub position: i64,
    pub state: TokenState,
    pub created_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            position: self.position,
            state: self.state,
            group_id: self.group_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredCoordinationEntry {
    pub entry_id: CoordinationId,
    pub token_id: TokenId,
    pub kind: CoordinationKind,
    pub from_group_id: GroupId,
    pub to_group_id: GroupId,
    pub old_position: i64,
    pub new_position: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

const TOKEN_COLUMNS: &str = "id, group_id, label, position, state, created_at";
const GROUP_COLUMNS: &str = "g.id, g.name, g.state, g.created_at,
    (SELECT COUNT(*) FROM queue_tokens t WHERE t.group_id = g.id AND t.state = 'waiting')";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid queue database url '{database_url}'"))?
            .create_if_missing(true);
        if !database_url.contains(":memory:") {
            ensure_parent_dir(&connect_options)?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            group_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Serializes every position rewrite inside one group. Reads stay lock free.
    fn group_lock(&self, group_id: GroupId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .group_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(group_id).or_default().clone()
    }

    /// Opens a transaction whose first statement is a write, so SQLite hands out the write
    /// lock up front instead of failing a read-to-write upgrade under contention.
    async fn begin_write(&self, group_id: GroupId) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE queue_groups SET name = name WHERE id = ?")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to take queue write lock")?;
        Ok(tx)
    }

    pub async fn create_group(&self, name: &str) -> Result<GroupId> {
        let rec = sqlx::query("INSERT INTO queue_groups (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn load_group(&self, group_id: GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM queue_groups g WHERE g.id = ?"
        ))
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    pub async fn list_groups(&self) -> Result<Vec<StoredGroup>> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM queue_groups g ORDER BY g.id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    /// Opens, closes or takes a group into maintenance. Its waiting tokens stay queued.
    pub async fn set_group_state(
        &self,
        group_id: GroupId,
        state: GroupState,
    ) -> Result<Option<StoredGroup>> {
        let lock = self.group_lock(group_id);
        let _guard = lock.lock().await;

        let updated = sqlx::query("UPDATE queue_groups SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(group_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to set state of group {group_id}"))?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.load_group(group_id).await
    }

    /// Appends a waiting token after the last waiting token of the group.
    /// Returns `None` when the group does not exist.
    pub async fn enqueue_token(&self, group_id: GroupId, label: &str) -> Result<Option<StoredToken>> {
        if self.load_group(group_id).await?.is_none() {
            return Ok(None);
        }

        let lock = self.group_lock(group_id);
        let _guard = lock.lock().await;

        let mut tx = self.begin_write(group_id).await?;
        let position = next_waiting_position(&mut tx, group_id).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO queue_tokens (group_id, label, position, state)
             VALUES (?, ?, ?, 'waiting')
             RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(group_id.0)
        .bind(label)
        .bind(position)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to enqueue token in group {group_id}"))?;
        let token = token_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(token))
    }

    pub async fn read_token(&self, token_id: TokenId) -> Result<Option<StoredToken>> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM queue_tokens WHERE id = ?"
        ))
        .bind(token_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    pub async fn list_tokens(
        &self,
        group_id: GroupId,
        state: Option<TokenState>,
    ) -> Result<Vec<StoredToken>> {
        let rows = if let Some(state) = state {
            sqlx::query(&format!(
                "SELECT {TOKEN_COLUMNS} FROM queue_tokens
                 WHERE group_id = ? AND state = ?
                 ORDER BY position ASC, id ASC"
            ))
            .bind(group_id.0)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {TOKEN_COLUMNS} FROM queue_tokens
                 WHERE group_id = ?
                 ORDER BY position ASC, id ASC"
            ))
            .bind(group_id.0)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(token_from_row).collect()
    }

    /// Number of waiting tokens served before this one, or `None` if the token is unknown
    /// or not waiting.
    pub async fn tokens_ahead(&self, token_id: TokenId) -> Result<Option<i64>> {
        let Some(token) = self.read_token(token_id).await? else {
            return Ok(None);
        };
        if !token.state.is_reorderable() {
            return Ok(None);
        }
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_tokens
             WHERE group_id = ? AND state = 'waiting' AND position < ?",
        )
        .bind(token.group_id.0)
        .bind(token.position)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(count))
    }

    /// Moves a token through its lifecycle. A token re-entering `waiting` is appended to the
    /// end of its queue; leaving `waiting` keeps the remaining positions untouched.
    pub async fn set_token_state(
        &self,
        token_id: TokenId,
        state: TokenState,
    ) -> Result<Option<StoredToken>> {
        let Some(current) = self.read_token(token_id).await? else {
            return Ok(None);
        };

        let lock = self.group_lock(current.group_id);
        let _guard = lock.lock().await;

        let mut tx = self.begin_write(current.group_id).await?;
        let row = if state.is_reorderable() && !current.state.is_reorderable() {
            let position = next_waiting_position(&mut tx, current.group_id).await?;
            sqlx::query(&format!(
                "UPDATE queue_tokens SET state = ?, position = ? WHERE id = ?
                 RETURNING {TOKEN_COLUMNS}"
            ))
            .bind(state.as_str())
            .bind(position)
            .bind(token_id.0)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            sqlx::query(&format!(
                "UPDATE queue_tokens SET state = ? WHERE id = ? RETURNING {TOKEN_COLUMNS}"
            ))
            .bind(state.as_str())
            .bind(token_id.0)
            .fetch_optional(&mut *tx)
            .await?
        };
        let token = row.as_ref().map(token_from_row).transpose()?;
        tx.commit().await?;
        Ok(token)
    }

    /// Atomically moves a waiting token from `old_position` to `new_position` and shifts the
    /// waiting tokens in between by one slot. Gaps outside the moved range are preserved.
    ///
    /// Returns `Ok(false)` when the move is rejected: unknown token, token no longer waiting,
    /// `old_position` is stale, or `new_position` lies outside `1..=last waiting position`.
    pub async fn reorder_token(
        &self,
        token_id: TokenId,
        new_position: i64,
        old_position: i64,
    ) -> Result<bool> {
        let Some(current) = self.read_token(token_id).await? else {
            return Ok(false);
        };
        let group_id = current.group_id;

        let lock = self.group_lock(group_id);
        let _guard = lock.lock().await;

        let mut tx = self.begin_write(group_id).await?;
        let Some(locked) = load_token_in_tx(&mut tx, token_id).await? else {
            return Ok(false);
        };
        if locked.group_id != group_id
            || locked.position != old_position
            || !locked.state.is_reorderable()
        {
            return Ok(false);
        }
        if new_position == old_position {
            return Ok(true);
        }

        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(position) FROM queue_tokens WHERE group_id = ? AND state = 'waiting'",
        )
        .bind(group_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if new_position < 1 || new_position > last.unwrap_or(0) {
            return Ok(false);
        }

        park_token(&mut tx, token_id).await?;
        if new_position > old_position {
            shift_waiting(&mut tx, group_id, old_position + 1, new_position, -1).await?;
        } else {
            shift_waiting(&mut tx, group_id, new_position, old_position - 1, 1).await?;
        }
        sqlx::query("UPDATE queue_tokens SET position = ? WHERE id = ?")
            .bind(new_position)
            .bind(token_id.0)
            .execute(&mut *tx)
            .await?;

        insert_coordination(
            &mut tx,
            token_id,
            CoordinationKind::PositionChange,
            (group_id, group_id),
            (old_position, new_position),
            None,
        )
        .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit reorder of token {token_id}"))?;
        Ok(true)
    }

    /// Explicit room change: the token joins the end of `target_group_id` and the gap it
    /// leaves in the source queue is closed. Only waiting tokens can be transferred.
    pub async fn transfer_token(
        &self,
        token_id: TokenId,
        target_group_id: GroupId,
        reason: Option<&str>,
    ) -> Result<bool> {
        let Some(current) = self.read_token(token_id).await? else {
            return Ok(false);
        };
        let source_group_id = current.group_id;
        if source_group_id == target_group_id {
            return Ok(false);
        }

        let (first, second) = if source_group_id < target_group_id {
            (source_group_id, target_group_id)
        } else {
            (target_group_id, source_group_id)
        };
        let first_lock = self.group_lock(first);
        let second_lock = self.group_lock(second);
        let _first_guard = first_lock.lock().await;
        let _second_guard = second_lock.lock().await;

        let mut tx = self.begin_write(source_group_id).await?;
        let Some(locked) = load_token_in_tx(&mut tx, token_id).await? else {
            return Ok(false);
        };
        if locked.group_id != source_group_id || !locked.state.is_reorderable() {
            return Ok(false);
        }
        let target_state: Option<String> =
            sqlx::query_scalar("SELECT state FROM queue_groups WHERE id = ?")
                .bind(target_group_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let target_open = target_state
            .as_deref()
            .and_then(GroupState::parse)
            .is_some_and(GroupState::accepts_transfers);
        if !target_open {
            return Ok(false);
        }

        let new_position = next_waiting_position(&mut tx, target_group_id).await?;
        sqlx::query("UPDATE queue_tokens SET group_id = ?, position = ? WHERE id = ?")
            .bind(target_group_id.0)
            .bind(new_position)
            .bind(token_id.0)
            .execute(&mut *tx)
            .await?;
        shift_waiting(&mut tx, source_group_id, locked.position + 1, i64::MAX, -1).await?;

        insert_coordination(
            &mut tx,
            token_id,
            CoordinationKind::RoomChange,
            (source_group_id, target_group_id),
            (locked.position, new_position),
            reason,
        )
        .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit transfer of token {token_id}"))?;
        Ok(true)
    }

    /// Coordination entries that touch `group_id`, newest first.
    pub async fn coordination_log(
        &self,
        group_id: GroupId,
        limit: u32,
    ) -> Result<Vec<StoredCoordinationEntry>> {
        let rows = sqlx::query(
            "SELECT id, token_id, kind, from_group_id, to_group_id, old_position, new_position, reason, created_at
             FROM coordination_log
             WHERE from_group_id = ? OR to_group_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(group_id.0)
        .bind(group_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let kind = match r.get::<String, _>(2).as_str() {
                    "room_change" => CoordinationKind::RoomChange,
                    "position_change" => CoordinationKind::PositionChange,
                    other => return Err(anyhow!("unknown coordination kind '{other}'")),
                };
                Ok(StoredCoordinationEntry {
                    entry_id: CoordinationId(r.get::<i64, _>(0)),
                    token_id: TokenId(r.get::<i64, _>(1)),
                    kind,
                    from_group_id: GroupId(r.get::<i64, _>(3)),
                    to_group_id: GroupId(r.get::<i64, _>(4)),
                    old_position: r.get::<i64, _>(5),
                    new_position: r.get::<i64, _>(6),
                    reason: r.get::<Option<String>, _>(7),
                    created_at: r.get::<DateTime<Utc>, _>(8),
                })
            })
            .collect()
    }
}

fn group_from_row(row: &SqliteRow) -> Result<StoredGroup> {
    let raw_state = row.get::<String, _>(2);
    let state = GroupState::parse(&raw_state)
        .ok_or_else(|| anyhow!("unknown group state '{raw_state}'"))?;
    Ok(StoredGroup {
        group_id: GroupId(row.get::<i64, _>(0)),
        name: row.get::<String, _>(1),
        state,
        created_at: row.get::<DateTime<Utc>, _>(3),
        waiting_count: row.get::<i64, _>(4),
    })
}

fn token_from_row(row: &SqliteRow) -> Result<StoredToken> {
    let raw_state = row.get::<String, _>(4);
    let state = TokenState::parse(&raw_state)
        .ok_or_else(|| anyhow!("unknown token state '{raw_state}'"))?;
    Ok(StoredToken {
        token_id: TokenId(row.get::<i64, _>(0)),
        group_id: GroupId(row.get::<i64, _>(1)),
        label: row.get::<String, _>(2),
        position: row.get::<i64, _>(3),
        state,
        created_at: row.get::<DateTime<Utc>, _>(5),
    })
}

async fn load_token_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    token_id: TokenId,
) -> Result<Option<StoredToken>> {
    let row = sqlx::query(&format!(
        "SELECT {TOKEN_COLUMNS} FROM queue_tokens WHERE id = ?"
    ))
    .bind(token_id.0)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(token_from_row).transpose()
}

async fn next_waiting_position(
    tx: &mut Transaction<'_, Sqlite>,
    group_id: GroupId,
) -> Result<i64> {
    let last: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(position) FROM queue_tokens WHERE group_id = ? AND state = 'waiting'",
    )
    .bind(group_id.0)
    .fetch_one(&mut **tx)
    .await?;
    Ok(last.unwrap_or(0) + 1)
}

/// Takes the token out of the positive range so the shift below cannot collide with it.
async fn park_token(tx: &mut Transaction<'_, Sqlite>, token_id: TokenId) -> Result<()> {
    sqlx::query("UPDATE queue_tokens SET position = 0 WHERE id = ?")
        .bind(token_id.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Adds `delta` to every waiting position in `from..=to`. SQLite checks the unique index row
/// by row, so the rows are first flipped negative and then flipped back.
async fn shift_waiting(
    tx: &mut Transaction<'_, Sqlite>,
    group_id: GroupId,
    from: i64,
    to: i64,
    delta: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE queue_tokens SET position = -(position + ?)
         WHERE group_id = ? AND state = 'waiting' AND position BETWEEN ? AND ?",
    )
    .bind(delta)
    .bind(group_id.0)
    .bind(from)
    .bind(to)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "UPDATE queue_tokens SET position = -position
         WHERE group_id = ? AND state = 'waiting' AND position < 0",
    )
    .bind(group_id.0)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_coordination(
    tx: &mut Transaction<'_, Sqlite>,
    token_id: TokenId,
    kind: CoordinationKind,
    (from_group_id, to_group_id): (GroupId, GroupId),
    (old_position, new_position): (i64, i64),
    reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO coordination_log (token_id, kind, from_group_id, to_group_id, old_position, new_position, reason)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(token_id.0)
    .bind(kind.as_str())
    .bind(from_group_id.0)
    .bind(to_group_id.0)
    .bind(old_position)
    .bind(new_position)
    .bind(reason)
    .execute(&mut **tx)
    .await
    .context("failed to record coordination entry")?;
    Ok(())
}

/// File-backed databases may point into a directory that does not exist yet.
fn ensure_parent_dir(options: &SqliteConnectOptions) -> Result<()> {
    let Some(parent) = options
        .get_filename()
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    else {
        return Ok(());
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create database directory '{}'", parent.display()))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
