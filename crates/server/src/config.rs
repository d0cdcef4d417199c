use std::{collections::HashMap, fs};

use anyhow::bail;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/queue.db".into(),
            event_buffer: 256,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
        settings.server_bind = v.to_string();
    }
    if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
        settings.database_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("event_buffer").and_then(toml::Value::as_integer) {
        settings.event_buffer = usize::try_from(v).unwrap_or(1).max(1);
    }
}

/// Turns the configured location into a URL the queue store opens. Bare paths and
/// `sqlite:path` become `sqlite://path`; `Storage::new` creates missing parent directories.
pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let raw = raw_database_url.trim();
    if raw.is_empty() {
        return Ok(Settings::default().database_url);
    }
    if raw.starts_with("sqlite::memory:") || raw.starts_with("sqlite://") {
        return Ok(raw.to_string());
    }
    if let Some((scheme, _)) = raw.split_once("://") {
        bail!("unsupported database scheme '{scheme}': the queue store runs on SQLite only");
    }

    let path = raw.strip_prefix("sqlite:").unwrap_or(raw).replace('\\', "/");
    Ok(format!("sqlite://{path}"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
