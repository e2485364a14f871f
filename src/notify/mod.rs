// Notifications: rendering alerts and delivering them to the messaging channel.

pub mod render;
pub mod telegram;
pub mod traits;

pub use telegram::TelegramNotifier;
pub use traits::{Attachment, Delivery, Notifier, OutgoingMessage};
