use super::{DeliveryReceipt, Notification, Notifier};
use crate::subscriptions::ChannelRef;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Upper bound on attempts per call; total back-off stays near one minute.
const MAX_ATTEMPTS: u8 = 8;

/// 500ms, 1s, 2s, ... for attempt 1, 2, 3, ...
fn backoff(attempt: u8) -> Duration {
    let shift = u32::from(attempt.saturating_sub(1));
    Duration::from_millis(500u64.checked_shl(shift).unwrap_or(u64::MAX))
}

/// Bot API client: `sendPhoto`/`sendMessage` plus a reaction as acknowledgment.
#[derive(Clone)]
pub struct TelegramNotifier {
    api_base: String,
    token: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    reaction: String,
}

impl TelegramNotifier {
    pub fn new(token: String) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            reaction: "🔥".to_string(),
        }
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.clamp(1, MAX_ATTEMPTS);
        self
    }

    pub fn with_reaction(mut self, emoji: &str) -> Self {
        self.reaction = emoji.to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, body: &T) -> Result<ApiResponse> {
        let url = self.method_url(method);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    if status.is_success() {
                        let parsed: ApiResponse =
                            rsp.json().await.with_context(|| format!("{method}: decode response"))?;
                        if !parsed.ok {
                            return Err(anyhow!(
                                "{method}: api error: {}",
                                parsed.description.unwrap_or_default()
                            ));
                        }
                        return Ok(parsed);
                    }
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    // 400/403 (chat gone, bot kicked) are not worth retrying
                    return Err(anyhow!("{method}: HTTP {status}"));
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(anyhow!("{method}: request failed: {e}"));
                }
            }
        }
    }
}

/// `"-100123"` or `"-100123/45"` (forum thread).
fn split_channel(channel: &ChannelRef) -> (&str, Option<i64>) {
    match channel.0.split_once('/') {
        Some((chat, thread)) => (chat, thread.trim().parse().ok()),
        None => (channel.0.as_str(), None),
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, channel: &ChannelRef, msg: &Notification) -> Result<DeliveryReceipt> {
        let (chat_id, thread_id) = split_channel(channel);
        let resp = match &msg.image_url {
            Some(photo) => {
                let body = SendPhoto {
                    chat_id,
                    message_thread_id: thread_id,
                    photo,
                    caption: &msg.text,
                    parse_mode: "Markdown",
                };
                self.call("sendPhoto", &body).await?
            }
            None => {
                let body = SendMessage {
                    chat_id,
                    message_thread_id: thread_id,
                    text: &msg.text,
                    parse_mode: "Markdown",
                };
                self.call("sendMessage", &body).await?
            }
        };
        let message_id = resp
            .result
            .map(|r| r.message_id)
            .ok_or_else(|| anyhow!("send: response without message_id"))?;
        Ok(DeliveryReceipt {
            channel: channel.clone(),
            message_id,
        })
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let (chat_id, _) = split_channel(&receipt.channel);
        let body = SetReaction {
            chat_id,
            message_id: receipt.message_id,
            reaction: vec![ReactionType {
                kind: "emoji",
                emoji: &self.reaction,
            }],
        };
        self.call("setMessageReaction", &body).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct SendPhoto<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    photo: &'a str,
    caption: &'a str,
    parse_mode: &'a str,
}

#[derive(Serialize)]
struct ReactionType<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    emoji: &'a str,
}

#[derive(Serialize)]
struct SetReaction<'a> {
    chat_id: &'a str,
    message_id: i64,
    reaction: Vec<ReactionType<'a>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "message_or_other")]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// `result` is a message for send calls and a bare `true` for reactions.
fn message_or_other<'de, D>(d: D) -> std::result::Result<Option<SentMessage>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(d)?;
    Ok(serde_json::from_value(v).ok())
}
