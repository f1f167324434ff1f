//! Telegram status surface: one live status message per
//! `(chat, worker)` pair, edited in place and recreated when the edit
//! fails. Delivery is best-effort and never affects loop correctness.

use std::{fs, path::PathBuf, time::Duration};

use chrono::Local;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use shared::utils::{format_duration, snippet};
use tracing::*;

use crate::{config::Config, status::WorkerStatus};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TgResponse {
    #[serde(default)]
    result: Option<TgMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
}

pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    worker: String,
    state_path: PathBuf,
    message_id: Option<i64>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: &Config, state_path: PathBuf) -> TelegramNotifier {
        TelegramNotifier {
            token: config.telegram_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
            worker: config.worker_name.clone(),
            state_path,
            message_id: None,
            client: reqwest::Client::new(),
        }
    }

    /// Apply a reloaded config without losing the live message id.
    pub fn reconfigure(&mut self, config: &Config) {
        if self.chat_id != config.telegram_chat_id || self.worker != config.worker_name {
            self.message_id = None;
        }
        self.token = config.telegram_token.clone();
        self.chat_id = config.telegram_chat_id.clone();
        self.worker = config.worker_name.clone();
    }

    pub async fn update_status(&mut self, status: &WorkerStatus) {
        self.edit_status(&format_status_html(status)).await;
    }

    pub async fn send_notification(&mut self, message: &str) {
        self.edit_status(message).await;
    }

    async fn edit_status(&mut self, message: &str) {
        if self.token.is_empty() || self.chat_id.is_empty() {
            debug!("telegram settings missing, notification skipped");
            return;
        }
        let message = if self.worker.is_empty() {
            message.to_string()
        } else {
            format!("👷 <b>Worker</b>: <code>{}</code>\n\n{message}", escape_html(&self.worker))
        };

        let Some(message_id) = self.ensure_status_message(&message).await else {
            return;
        };

        let mut state = self.load_state();
        let new_hash = content_hash(&message);
        if state.get(&self.hash_key()).and_then(Value::as_str) == Some(new_hash.as_str()) {
            debug!("telegram status unchanged, edit skipped");
            return;
        }

        let url = format!("https://api.telegram.org/bot{}/editMessageText", self.token);
        let form = [
            ("chat_id", self.chat_id.clone()),
            ("message_id", message_id.to_string()),
            ("text", message.clone()),
            ("parse_mode", "HTML".to_string()),
            ("disable_web_page_preview", "true".to_string()),
        ];
        let response =
            match self.client.post(&url).timeout(SEND_TIMEOUT).form(&form).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!("request error while editing telegram message: {err}");
                    return;
                }
            };

        if response.status().as_u16() == 200 {
            state.insert(self.hash_key(), Value::String(new_hash));
            self.save_state(&state);
            return;
        }

        let body = response.text().await.unwrap_or_default();
        let description = serde_json::from_str::<TgResponse>(&body)
            .ok()
            .and_then(|r| r.description)
            .unwrap_or_default();
        if description.to_lowercase().contains("message is not modified") {
            state.insert(self.hash_key(), Value::String(new_hash));
            self.save_state(&state);
            return;
        }

        // stale message id: forget it and recreate the status message
        state.remove(&self.status_key());
        self.save_state(&state);
        self.message_id = None;
        self.ensure_status_message(&message).await;
        warn!("telegram edit failed, recreated status message: {}", snippet(&body, 120));
    }

    async fn ensure_status_message(&mut self, initial_text: &str) -> Option<i64> {
        if self.message_id.is_some() {
            return self.message_id;
        }
        let mut state = self.load_state();
        if let Some(id) = state.get(&self.status_key()).and_then(Value::as_i64) {
            self.message_id = Some(id);
            return self.message_id;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        match self.send_message(&url, initial_text, true).await {
            Some(id) => {
                self.remember_message(&mut state, id, initial_text);
                Some(id)
            }
            None => {
                // HTML can be rejected for odd content; retry plain
                let plain = strip_tags(initial_text);
                let id = self.send_message(&url, &plain, false).await?;
                self.remember_message(&mut state, id, &plain);
                Some(id)
            }
        }
    }

    async fn send_message(&self, url: &str, text: &str, html: bool) -> Option<i64> {
        let mut form = vec![
            ("chat_id", self.chat_id.clone()),
            ("text", text.to_string()),
            ("disable_web_page_preview", "true".to_string()),
        ];
        if html {
            form.push(("parse_mode", "HTML".to_string()));
        }
        let response = match self.client.post(url).timeout(SEND_TIMEOUT).form(&form).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("request error while creating telegram status message: {err}");
                return None;
            }
        };
        if response.status().as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!("error creating telegram status message: {}", snippet(&body, 200));
            return None;
        }
        let body = response.text().await.ok()?;
        serde_json::from_str::<TgResponse>(&body).ok()?.result.map(|m| m.message_id)
    }

    fn remember_message(&mut self, state: &mut Map<String, Value>, id: i64, text: &str) {
        self.message_id = Some(id);
        state.insert(self.status_key(), Value::from(id));
        state.insert(self.hash_key(), Value::String(content_hash(text)));
        self.save_state(state);
    }

    fn status_key(&self) -> String {
        let worker = if self.worker.is_empty() { "default" } else { &self.worker };
        format!("{}::{}", self.chat_id, worker)
    }

    fn hash_key(&self) -> String {
        format!("{}::last_hash", self.status_key())
    }

    fn load_state(&self) -> Map<String, Value> {
        fs::read_to_string(&self.state_path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    fn save_state(&self, state: &Map<String, Value>) {
        if let Ok(body) = serde_json::to_string(state) {
            if let Err(err) = fs::write(&self.state_path, body) {
                warn!("failed to save telegram state: {err:#}");
            }
        }
    }
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Render the status record the way the operators expect to read it.
pub fn format_status_html(status: &WorkerStatus) -> String {
    let mut lines = vec![
        "📊 <b>Status</b>".to_string(),
        format!("🧩 <b>Session</b>: <code>{}</code>", escape_html(&status.session.id)),
        format!(
            "⏳ <b>Active</b>: <code>{}</code>",
            escape_html(&format_duration(status.session.active_secs()))
        ),
        format!("✅ <b>Blocks</b>: <code>{}</code>", status.session.blocks),
        format!("🔁 <b>Consecutive</b>: <code>{}</code>", status.session.consecutive),
        format!("⚙️ <b>GPU</b>: <code>{}</code>", escape_html(&status.gpu)),
        format!("🧠 <b>Algorithm</b>: <code>{}</code>", escape_html(&status.algorithm)),
        format!("🧭 <b>Range</b>: <code>{}</code>", escape_html(&status.range)),
        format!("📫 <b>Addresses</b>: <code>{}</code>", status.addresses),
        format!("📦 <b>Pending Keys</b>: <code>{}</code>", status.pending_keys),
        format!("📤 <b>Last Batch</b>: <code>{}</code>", escape_html(&status.last_batch)),
        format!("❗ <b>Last Error</b>: <i>{}</i>", escape_html(&status.last_error)),
        format!("🔑 <b>Keyfound</b>: <code>{}</code>", escape_html(&status.keyfound)),
        format!("⏱️ <b>Next Fetch</b>: <code>{}s</code>", status.next_fetch_in),
        format!("🕒 <i>Updated {}</i>", Local::now().format("%Y-%m-%d %H:%M:%S")),
    ];
    if status.all_blocks_solved {
        lines.push("🏁 <b>All blocks solved</b> ✅".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escaping() {
        assert_eq!(escape_html("a<b> & c"), "a&lt;b&gt; &amp; c");
    }

    #[test]
    fn tag_stripping() {
        assert_eq!(strip_tags("<b>bold</b> and <i>x</i>"), "bold and x");
        assert_eq!(strip_tags("no tags"), "no tags");
    }

    #[test]
    fn status_render_carries_fields() {
        let mut status = WorkerStatus::new();
        status.range = "100:200".to_string();
        status.pending_keys = 7;
        status.last_error = "Post error `503`".to_string();
        let html = format_status_html(&status);
        assert!(html.contains("<code>100:200</code>"));
        assert!(html.contains("<code>7</code>"));
        assert!(html.contains("Post error `503`"));
        assert!(!html.contains("All blocks solved"));

        status.all_blocks_solved = true;
        assert!(format_status_html(&status).contains("All blocks solved"));
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = content_hash("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("abc"));
        assert_ne!(h, content_hash("abd"));
    }
}
