// Notifier trait: the messaging channel the dispatcher delivers to.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PipelineResult;

/// A rendered alert, ready for the messaging channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// HTML-formatted body.
    pub text: String,
    /// Downloaded media to attach. Best-effort.
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub kind: crate::db::models::MediaKind,
    pub path: PathBuf,
}

/// Acknowledgment from the messaging channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message. `Ok` means the text body was accepted.
    async fn send(&self, message: &OutgoingMessage) -> PipelineResult<Delivery>;
}
