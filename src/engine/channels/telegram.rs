// Clawdbot Gateway — Telegram Adapter
//
// Long-polling (getUpdates) against the Bot API. No public URL, no
// webhook middleman: the gateway pulls updates directly.
//
// Contract with the core:
//   - the update cursor is persisted BEFORE an event enters the sink,
//     so a crash never replays a consumed update
//   - allowed_updates declares edited messages and reactions, so the
//     transport does not silently prune them
//   - failures bubble to the shared supervisor, which classifies them
//     (a 409 getUpdates conflict is a rate-limit class retry)

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::channels::access::{self, AccessDecision, PendingUser};
use crate::engine::channels::sink::{ChannelSink, TransportSender};
use crate::engine::channels::{run_supervised, split_message, SupervisorOpts};
use crate::engine::backoff::BackoffPolicy;
use crate::engine::config::ResolvedAccount;
use crate::engine::offsets::OffsetStore;
use crate::engine::runtime::AgentRuntime;
use crate::engine::state::Env;
use crate::engine::types::{InboundMessage, PeerKind};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TG_API: &str = "https://api.telegram.org/bot";
/// Telegram's hard message limit is 4096; leave headroom for framing.
const TG_MESSAGE_LIMIT: usize = 4000;
const POLL_TIMEOUT_SECS: u64 = 30;
/// Update kinds we ask for. Reactions and edits are listed explicitly —
/// Telegram prunes unlisted types.
const ALLOWED_UPDATES: &[&str] = &["message", "edited_message", "message_reaction"];

// ── Wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    edited_message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
    message_thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    is_bot: bool,
    first_name: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
}

// ── Normalization ──────────────────────────────────────────────────────

/// Convert one update into the transport-agnostic event shape. Bot
/// messages and non-text updates yield None (their update id is still
/// consumed by the caller).
pub(crate) fn normalize_update(update: &TgUpdate, account_id: &str) -> Option<InboundMessage> {
    let msg = update.message.as_ref().or(update.edited_message.as_ref())?;
    let user = msg.from.as_ref()?;
    if user.is_bot {
        return None;
    }
    let text = msg.text.as_deref().filter(|t| !t.is_empty())?;

    let is_group = matches!(msg.chat.chat_type.as_str(), "group" | "supergroup");
    Some(InboundMessage {
        transport: "telegram".into(),
        account_id: account_id.to_string(),
        peer_id: user.id.to_string(),
        username: user.username.clone(),
        display_name: Some(user.first_name.clone()),
        peer_kind: if is_group { PeerKind::Group } else { PeerKind::Dm },
        group_id: is_group.then(|| msg.chat.id.to_string()),
        thread_id: msg.message_thread_id.map(|t| t.to_string()),
        text: text.to_string(),
        message_id: Some(msg.message_id.to_string()),
        update_id: Some(update.update_id),
        received_at: Utc::now().to_rfc3339(),
    })
}

/// Chat id to address replies to.
fn reply_chat_id(msg: &InboundMessage) -> String {
    msg.group_id.clone().unwrap_or_else(|| msg.peer_id.clone())
}

// ── Sender ─────────────────────────────────────────────────────────────

struct TelegramSender {
    client: reqwest::Client,
    token: String,
}

impl TelegramSender {
    async fn send_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> GatewayResult<Option<String>> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(msg_id) = reply_to {
            body["reply_to_message_id"] = json!(msg_id.parse::<i64>().unwrap_or_default());
        }
        let url = format!("{}{}/sendMessage", TG_API, self.token);
        let resp = self.client.post(&url).json(&body).send().await?;
        if resp.status().is_success() {
            let parsed: TgResponse<serde_json::Value> = resp.json().await?;
            return Ok(parsed
                .result
                .and_then(|r| r["message_id"].as_i64())
                .map(|id| id.to_string()));
        }
        // Some replies break Markdown parsing; retry plain.
        let mut retry = json!({"chat_id": chat_id, "text": text});
        if let Some(msg_id) = reply_to {
            retry["reply_to_message_id"] = json!(msg_id.parse::<i64>().unwrap_or_default());
        }
        let resp = self.client.post(&url).json(&retry).send().await?;
        if !resp.status().is_success() {
            warn!("[telegram] sendMessage failed with {}", resp.status());
        }
        Ok(None)
    }
}

#[async_trait]
impl TransportSender for TelegramSender {
    async fn send_text(&self, msg: &InboundMessage, text: &str) -> GatewayResult<()> {
        let chat_id = reply_chat_id(msg);
        for (i, chunk) in split_message(text, TG_MESSAGE_LIMIT).iter().enumerate() {
            // Reply-link only the first chunk.
            let reply_to = if i == 0 { msg.message_id.as_deref() } else { None };
            self.send_chunk(&chat_id, chunk, reply_to).await?;
        }
        Ok(())
    }

    async fn send_ack(&self, msg: &InboundMessage, text: &str) -> GatewayResult<Option<String>> {
        self.send_chunk(&reply_chat_id(msg), text, msg.message_id.as_deref()).await
    }

    async fn edit_message(
        &self,
        msg: &InboundMessage,
        message_id: &str,
        text: &str,
    ) -> GatewayResult<()> {
        let chat_id = reply_chat_id(msg);
        let chunks = split_message(text, TG_MESSAGE_LIMIT);
        let url = format!("{}{}/editMessageText", TG_API, self.token);
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id.parse::<i64>().unwrap_or_default(),
            "text": chunks[0],
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            // Fall back to a fresh message rather than losing the reply.
            self.send_chunk(&chat_id, &chunks[0], None).await?;
        }
        for chunk in &chunks[1..] {
            self.send_chunk(&chat_id, chunk, None).await?;
        }
        Ok(())
    }

    async fn send_typing(&self, msg: &InboundMessage) -> GatewayResult<()> {
        let url = format!("{}{}/sendChatAction", TG_API, self.token);
        let body = json!({"chat_id": reply_chat_id(msg), "action": "typing"});
        let _ = self.client.post(&url).json(&body).send().await;
        Ok(())
    }
}

// ── Adapter ────────────────────────────────────────────────────────────

pub struct TelegramAdapter {
    env: Arc<Env>,
    account: ResolvedAccount,
    token: String,
    client: reqwest::Client,
    offsets: OffsetStore,
    sink: Arc<ChannelSink>,
    pending: Mutex<Vec<PendingUser>>,
    allow_from: Mutex<Vec<String>>,
    sender: Arc<TelegramSender>,
}

impl TelegramAdapter {
    /// Build the adapter for one account. Credentials merge: account
    /// config first, then the TELEGRAM_BOT_TOKEN environment variable.
    pub fn new(
        env: Arc<Env>,
        runtime: Arc<dyn AgentRuntime>,
        account_id: &str,
    ) -> GatewayResult<Arc<Self>> {
        let cfg = &env.config.telegram;
        let account = cfg
            .resolve_account(account_id, "telegram")
            .ok_or_else(|| GatewayError::Config(format!("Unknown telegram account {:?}", account_id)))?;
        if !account.enabled {
            return Err(GatewayError::Config(format!(
                "Telegram account {:?} is disabled",
                account_id
            )));
        }
        let token = account
            .credentials
            .clone()
            .or_else(|| std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                GatewayError::Config(
                    "No bot token configured. Get one from @BotFather and set telegram.credentials"
                        .into(),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;
        let sender = Arc::new(TelegramSender { client: client.clone(), token: token.clone() });
        let sink = ChannelSink::new(env.clone(), runtime, sender.clone());
        let offsets =
            OffsetStore::new(&env.state_dir, env.agent_id(), "telegram", &account.account_id);
        let allow_from = account.allow_from.clone();

        Ok(Arc::new(TelegramAdapter {
            env,
            account,
            token,
            client,
            offsets,
            sink,
            pending: Mutex::new(Vec::new()),
            allow_from: Mutex::new(allow_from),
            sender,
        }))
    }

    /// Run until shutdown. Never returns except on abort or a
    /// non-retryable failure.
    pub async fn monitor(self: Arc<Self>) -> GatewayResult<()> {
        let opts = SupervisorOpts {
            channel: "telegram".into(),
            account_id: self.account.account_id.clone(),
            policy: BackoffPolicy::default(),
            abort: self.env.abort.clone(),
        };
        let adapter = self.clone();
        run_supervised(opts, move || {
            let adapter = adapter.clone();
            async move { adapter.poll_loop().await }
        })
        .await
    }

    async fn poll_loop(self: Arc<Self>) -> GatewayResult<()> {
        let (username, name) = self.get_me().await?;
        info!(
            "[telegram] Account {} connected as @{} ({})",
            self.account.account_id, username, name
        );

        let mut offset = self.offsets.read().unwrap_or(0);
        loop {
            if self.env.abort.is_cancelled() {
                info!("[telegram] Shutdown — leaving poll loop");
                return Ok(());
            }
            let updates = self.get_updates(offset + 1).await?;
            for update in updates {
                offset = offset.max(update.update_id);
                // Accept the cursor before anything runs — at-least-once
                // delivery of output without redelivery of input.
                self.offsets.write(update.update_id)?;

                let Some(msg) = normalize_update(&update, &self.account.account_id) else {
                    continue;
                };
                debug!(
                    "[telegram] Message from {} ({}): {}",
                    msg.username.as_deref().unwrap_or("?"),
                    msg.peer_id,
                    crate::engine::types::truncate_utf8(&msg.text, 50)
                );
                if self.check_access(&msg).await {
                    self.sink.submit(msg);
                }
            }
        }
    }

    /// DM/group policy. Returns true when the event may proceed;
    /// otherwise the denial/pairing message has been sent.
    async fn check_access(&self, msg: &InboundMessage) -> bool {
        let decision = match (&msg.peer_kind, &msg.group_id) {
            (PeerKind::Group, Some(gid)) => {
                access::check_group_access(self.account.group_policy, gid, &self.allow_from.lock())
            }
            _ => access::check_dm_access(
                self.account.dm_policy,
                &msg.peer_id,
                msg.username.as_deref().unwrap_or(&msg.peer_id),
                msg.display_name.as_deref().unwrap_or(""),
                &self.allow_from.lock(),
                &mut self.pending.lock(),
                &self.env.audit,
            ),
        };
        match decision {
            AccessDecision::Allowed => true,
            AccessDecision::Denied { message } | AccessDecision::PairingPending { message } => {
                self.sender.send_text(msg, &message).await.ok();
                false
            }
        }
    }

    /// Approve a pending pairing request and notify the user.
    pub async fn approve_user(&self, user_id: &str) -> bool {
        let approved = access::approve_user(
            user_id,
            &mut self.allow_from.lock(),
            &mut self.pending.lock(),
            &self.env.audit,
        );
        if approved {
            let note = InboundMessage {
                transport: "telegram".into(),
                account_id: self.account.account_id.clone(),
                peer_id: user_id.to_string(),
                username: None,
                display_name: None,
                peer_kind: PeerKind::Dm,
                group_id: None,
                thread_id: None,
                text: String::new(),
                message_id: None,
                update_id: None,
                received_at: Utc::now().to_rfc3339(),
            };
            self.sender
                .send_text(&note, "You've been approved. Send any message to get started.")
                .await
                .ok();
        }
        approved
    }

    // ── Bot API calls ──────────────────────────────────────────────────

    async fn get_me(&self) -> GatewayResult<(String, String)> {
        let url = format!("{}{}/getMe", TG_API, self.token);
        let resp: TgResponse<serde_json::Value> = self.client.get(&url).send().await?.json().await?;
        if !resp.ok {
            return Err(GatewayError::channel(
                "telegram",
                format!("getMe failed: {}", resp.description.unwrap_or_default()),
            ));
        }
        let result = resp
            .result
            .ok_or_else(|| GatewayError::channel("telegram", "getMe returned no result"))?;
        Ok((
            result["username"].as_str().unwrap_or("unknown").to_string(),
            result["first_name"].as_str().unwrap_or("Bot").to_string(),
        ))
    }

    async fn get_updates(&self, offset: i64) -> GatewayResult<Vec<TgUpdate>> {
        let allowed = serde_json::to_string(ALLOWED_UPDATES).unwrap_or_default();
        let url = format!(
            "{}{}/getUpdates?offset={}&timeout={}&allowed_updates={}",
            TG_API, self.token, offset, POLL_TIMEOUT_SECS, allowed
        );
        let resp: TgResponse<Vec<TgUpdate>> = self.client.get(&url).send().await?.json().await?;
        if !resp.ok {
            return Err(GatewayError::channel(
                "telegram",
                format!("getUpdates error: {}", resp.description.unwrap_or_default()),
            ));
        }
        Ok(resp.result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_json(raw: serde_json::Value) -> TgUpdate {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn normalizes_a_dm() {
        let update = update_json(json!({
            "update_id": 100,
            "message": {
                "message_id": 7,
                "from": {"id": 42, "is_bot": false, "first_name": "Bob", "username": "bob"},
                "chat": {"id": 42, "type": "private"},
                "text": "hello there"
            }
        }));
        let msg = normalize_update(&update, "default").unwrap();
        assert_eq!(msg.transport, "telegram");
        assert_eq!(msg.peer_id, "42");
        assert_eq!(msg.peer_kind, PeerKind::Dm);
        assert_eq!(msg.group_id, None);
        assert_eq!(msg.text, "hello there");
        assert_eq!(msg.update_id, Some(100));
        assert_eq!(msg.message_id.as_deref(), Some("7"));
    }

    #[test]
    fn normalizes_a_supergroup_thread() {
        let update = update_json(json!({
            "update_id": 101,
            "message": {
                "message_id": 8,
                "from": {"id": 42, "is_bot": false, "first_name": "Bob"},
                "chat": {"id": -100123, "type": "supergroup"},
                "message_thread_id": 5,
                "text": "in a thread"
            }
        }));
        let msg = normalize_update(&update, "work").unwrap();
        assert_eq!(msg.peer_kind, PeerKind::Group);
        assert_eq!(msg.group_id.as_deref(), Some("-100123"));
        assert_eq!(msg.thread_id.as_deref(), Some("5"));
        assert_eq!(msg.account_id, "work");
        assert_eq!(
            msg.origin(),
            "telegram:work:group:-100123:thread:5"
        );
    }

    #[test]
    fn skips_bots_and_non_text() {
        let bot = update_json(json!({
            "update_id": 102,
            "message": {
                "message_id": 9,
                "from": {"id": 1, "is_bot": true, "first_name": "OtherBot"},
                "chat": {"id": 1, "type": "private"},
                "text": "beep"
            }
        }));
        assert!(normalize_update(&bot, "default").is_none());

        let sticker = update_json(json!({
            "update_id": 103,
            "message": {
                "message_id": 10,
                "from": {"id": 42, "is_bot": false, "first_name": "Bob"},
                "chat": {"id": 42, "type": "private"}
            }
        }));
        assert!(normalize_update(&sticker, "default").is_none());
    }

    #[test]
    fn edited_messages_are_fresh_events() {
        let update = update_json(json!({
            "update_id": 104,
            "edited_message": {
                "message_id": 7,
                "from": {"id": 42, "is_bot": false, "first_name": "Bob"},
                "chat": {"id": 42, "type": "private"},
                "text": "hello (edited)"
            }
        }));
        let msg = normalize_update(&update, "default").unwrap();
        assert_eq!(msg.text, "hello (edited)");
        assert_eq!(msg.update_id, Some(104));
    }

    #[test]
    fn allowed_updates_declare_edits_and_reactions() {
        assert!(ALLOWED_UPDATES.contains(&"message"));
        assert!(ALLOWED_UPDATES.contains(&"edited_message"));
        assert!(ALLOWED_UPDATES.contains(&"message_reaction"));
    }
}
