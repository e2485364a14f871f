// Telegram Bot API notifier.
//
// The text body goes out via sendMessage in HTML mode; that call alone
// decides success. Downloaded media follow as replies (sendPhoto/sendVideo)
// and a failed attachment is logged, never retried.
//
// API docs: https://core.telegram.org/bots/api

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::{Attachment, Delivery, Notifier, OutgoingMessage};
use crate::db::models::MediaKind;
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    async fn send_attachment(&self, attachment: &Attachment, reply_to: Option<&str>) -> PipelineResult<()> {
        let (method, field) = match attachment.kind {
            MediaKind::Image => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
        };

        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|e| PipelineError::PermanentItem(format!("read {}: {e}", attachment.path.display())))?;
        let file_name = attachment
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();

        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part(field, Part::bytes(bytes).file_name(file_name));
        if let Some(id) = reply_to {
            form = form.text("reply_to_message_id", id.to_string());
        }

        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await?;
        parse_reply(response).await.map(|_| ())
    }
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Classify a Bot API reply. 429 carries `parameters.retry_after`.
async fn parse_reply(response: reqwest::Response) -> PipelineResult<Option<String>> {
    let status = response.status();
    let body = response.text().await?;
    let reply: Option<TelegramReply> = serde_json::from_str(&body).ok();

    match reply {
        Some(reply) if status.is_success() && reply.ok => {
            Ok(reply.result.map(|m| m.message_id.to_string()))
        }
        Some(reply) => {
            let description = reply.description.unwrap_or_else(|| body.clone());
            match PipelineError::from_status("Telegram", status, &description) {
                PipelineError::TransientUpstream { message, .. } => {
                    Err(PipelineError::TransientUpstream {
                        message,
                        retry_after: reply
                            .parameters
                            .and_then(|p| p.retry_after)
                            .map(Duration::from_secs),
                    })
                }
                // 200 with ok=false: nothing in the status to go on
                _ if status.is_success() => Err(PipelineError::PermanentItem(format!(
                    "Telegram rejected message: {description}"
                ))),
                other => Err(other),
            }
        }
        None => Err(PipelineError::from_status("Telegram", status, &body)),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &OutgoingMessage) -> PipelineResult<Delivery> {
        let body = SendMessageBody {
            chat_id: &self.chat_id,
            text: &message.text,
            parse_mode: "HTML",
        };

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await?;
        let message_id = parse_reply(response).await?;
        debug!(message_id = ?message_id, "Telegram message sent");

        for attachment in &message.attachments {
            if let Err(e) = self.send_attachment(attachment, message_id.as_deref()).await {
                warn!(
                    path = %attachment.path.display(),
                    error = %e,
                    "Attachment delivery failed, continuing"
                );
            }
        }

        Ok(Delivery { message_id })
    }
}
