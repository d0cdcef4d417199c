use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use reorder_engine::{
    spawn_queue_listener, DropEvent, HttpQueueAccessor, QueueAccessor, QueueView, ReorderEngine,
    ReorderOutcome, StorageQueueAccessor,
};
use shared::{
    domain::{GroupId, GroupState, TokenId, TokenState},
    protocol::{Notification, TokenSummary},
};
use storage::Storage;
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/queue.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateGroup {
        name: String,
    },
    /// Lists groups with their status and number of waiting tokens.
    Groups,
    SetGroupState {
        group_id: i64,
        /// open, closed or maintenance.
        state: String,
    },
    Enqueue {
        group_id: i64,
        label: String,
    },
    List {
        group_id: i64,
        /// Only show tokens in this state (waiting, in_service, done, skipped).
        #[arg(long)]
        state: Option<String>,
    },
    /// How many waiting tokens will be served before this one.
    Ahead {
        token_id: i64,
    },
    SetState {
        token_id: i64,
        state: String,
    },
    Transfer {
        token_id: i64,
        target_group_id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    Log {
        group_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Follows a group on a running server and reprints it on every change.
    Watch {
        group_id: i64,
        #[arg(long)]
        server_url: String,
    },
    /// Replays a drag-and-drop through the reorder engine.
    Drop {
        group_id: i64,
        token_id: i64,
        /// Token the moved one was dropped below; omit for the top slot.
        #[arg(long)]
        after: Option<i64>,
        /// Group the token was dropped into, when it differs from `group_id`.
        #[arg(long)]
        into: Option<i64>,
        /// Talk to a running server instead of the local database.
        #[arg(long)]
        server_url: Option<String>,
    },
}

/// Where the console view re-reads the waiting queue from.
enum QueueSource {
    Storage(Storage),
    Http {
        http: reqwest::Client,
        server_url: String,
    },
}

impl QueueSource {
    async fn waiting(&self, group_id: GroupId) -> Result<Vec<(String, i64)>> {
        match self {
            QueueSource::Storage(storage) => Ok(storage
                .list_tokens(group_id, Some(TokenState::Waiting))
                .await?
                .into_iter()
                .map(|token| (token.label, token.position))
                .collect()),
            QueueSource::Http { http, server_url } => {
                let tokens: Vec<TokenSummary> = http
                    .get(format!(
                        "{}/groups/{}/tokens?state=waiting",
                        server_url.trim_end_matches('/'),
                        group_id.0
                    ))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(tokens
                    .into_iter()
                    .map(|token| (token.label, token.position))
                    .collect())
            }
        }
    }
}

struct ConsoleView {
    group_id: GroupId,
    source: QueueSource,
}

#[async_trait]
impl QueueView for ConsoleView {
    async fn reload(&self) -> Result<()> {
        let waiting = self.source.waiting(self.group_id).await?;
        println!("group {} waiting:", self.group_id);
        for (label, position) in waiting {
            println!("  {position:>3}  {label}");
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        println!("[{:?}] {}", notification.severity, notification.message);
    }
}

fn parse_state(raw: &str) -> Result<TokenState> {
    TokenState::parse(raw).ok_or_else(|| anyhow!("unknown token state '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Drop {
        group_id,
        token_id,
        after,
        into,
        server_url: Some(server_url),
    } = &cli.command
    {
        let accessor = HttpQueueAccessor::new(server_url.as_str());
        let source = QueueSource::Http {
            http: reqwest::Client::new(),
            server_url: server_url.clone(),
        };
        return run_drop(
            Arc::new(accessor),
            source,
            GroupId(*group_id),
            TokenId(*token_id),
            *after,
            *into,
        )
        .await;
    }

    if let Command::Watch {
        group_id,
        server_url,
    } = &cli.command
    {
        let group_id = GroupId(*group_id);
        let view = Arc::new(ConsoleView {
            group_id,
            source: QueueSource::Http {
                http: reqwest::Client::new(),
                server_url: server_url.clone(),
            },
        });
        view.reload().await?;
        let listener = spawn_queue_listener(server_url, group_id, view).await?;
        info!(group_id = group_id.0, "watching queue");
        listener.await?;
        return Ok(());
    }

    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateGroup { name } => {
            let group_id = storage.create_group(&name).await?;
            println!("created group_id={group_id}");
        }
        Command::Groups => {
            for group in storage.list_groups().await? {
                println!(
                    "{:>6}  {:<11}  waiting={:<4}  {}",
                    group.group_id,
                    group.state.as_str(),
                    group.waiting_count,
                    group.name
                );
            }
        }
        Command::SetGroupState { group_id, state } => {
            let state = GroupState::parse(&state)
                .ok_or_else(|| anyhow!("unknown group state '{state}'"))?;
            let group = storage
                .set_group_state(GroupId(group_id), state)
                .await?
                .ok_or_else(|| anyhow!("group {group_id} not found"))?;
            println!("group_id={} state={}", group.group_id, group.state);
        }
        Command::Enqueue { group_id, label } => {
            let token = storage
                .enqueue_token(GroupId(group_id), &label)
                .await?
                .ok_or_else(|| anyhow!("group {group_id} not found"))?;
            println!(
                "enqueued token_id={} position={}",
                token.token_id, token.position
            );
        }
        Command::List { group_id, state } => {
            let state = state.as_deref().map(parse_state).transpose()?;
            for token in storage.list_tokens(GroupId(group_id), state).await? {
                println!(
                    "{:>6}  {:>3}  {:<10}  {}",
                    token.token_id,
                    token.position,
                    token.state.as_str(),
                    token.label
                );
            }
        }
        Command::Ahead { token_id } => match storage.tokens_ahead(TokenId(token_id)).await? {
            Some(ahead) => println!("token_id={token_id} ahead={ahead}"),
            None => println!("token_id={token_id} is not waiting"),
        },
        Command::SetState { token_id, state } => {
            let state = parse_state(&state)?;
            let token = storage
                .set_token_state(TokenId(token_id), state)
                .await?
                .ok_or_else(|| anyhow!("token {token_id} not found"))?;
            println!(
                "token_id={} state={} position={}",
                token.token_id, token.state, token.position
            );
        }
        Command::Transfer {
            token_id,
            target_group_id,
            reason,
        } => {
            let accepted = storage
                .transfer_token(TokenId(token_id), GroupId(target_group_id), reason.as_deref())
                .await?;
            println!("accepted={accepted}");
        }
        Command::Log { group_id, limit } => {
            for entry in storage.coordination_log(GroupId(group_id), limit).await? {
                println!(
                    "{}  {}  token={}  {}:{} -> {}:{}{}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.kind.as_str(),
                    entry.token_id,
                    entry.from_group_id,
                    entry.old_position,
                    entry.to_group_id,
                    entry.new_position,
                    entry
                        .reason
                        .map(|reason| format!("  ({reason})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::Watch { .. } => {}
        Command::Drop {
            group_id,
            token_id,
            after,
            into,
            ..
        } => {
            let accessor = StorageQueueAccessor::new(storage.clone());
            run_drop(
                Arc::new(accessor),
                QueueSource::Storage(storage),
                GroupId(group_id),
                TokenId(token_id),
                after,
                into,
            )
            .await?;
        }
    }

    Ok(())
}

async fn run_drop(
    accessor: Arc<dyn QueueAccessor>,
    source: QueueSource,
    group_id: GroupId,
    token_id: TokenId,
    after: Option<i64>,
    into: Option<i64>,
) -> Result<()> {
    let view = Arc::new(ConsoleView { group_id, source });
    let engine = ReorderEngine::new(accessor, view);
    let event = DropEvent {
        moved_id: Some(token_id),
        source_group: Some(group_id),
        target_group: Some(into.map(GroupId).unwrap_or(group_id)),
        previous_id: after.map(TokenId),
    };
    match engine.handle_drop(event).await {
        ReorderOutcome::Failed(error) => Err(error.into()),
        outcome => {
            info!(?outcome, "drop handled");
            Ok(())
        }
    }
}
