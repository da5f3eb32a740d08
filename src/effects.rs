//! User-visible side effects — notifications, shortcuts, badge counts.
//!
//! These managers are fire-and-forget: they own their rendering concerns and
//! absorb their own failures, so the contracts are infallible. The pipeline
//! only ever touches them on a message's terminal success path.

use async_trait::async_trait;
use tracing::info;

use crate::store::ConversationId;

/// Updates or creates the notification for a conversation.
#[async_trait]
pub trait NotificationManager: Send + Sync {
    async fn update(&self, conversation_id: ConversationId);
}

/// Maintains the launcher shortcut list.
#[async_trait]
pub trait ShortcutManager: Send + Sync {
    async fn update_shortcuts(&self);
    async fn report_shortcut_used(&self, conversation_id: ConversationId);
}

/// Refreshes the unread badge and any widgets derived from it.
#[async_trait]
pub trait BadgeUpdater: Send + Sync {
    async fn refresh(&self);
}

/// Log-only notification manager for headless deployments.
pub struct LoggingNotifications;

#[async_trait]
impl NotificationManager for LoggingNotifications {
    async fn update(&self, conversation_id: ConversationId) {
        info!(conversation_id = %conversation_id, "Notification updated");
    }
}

/// Log-only shortcut manager for headless deployments.
pub struct LoggingShortcuts;

#[async_trait]
impl ShortcutManager for LoggingShortcuts {
    async fn update_shortcuts(&self) {
        info!("Shortcuts refreshed");
    }

    async fn report_shortcut_used(&self, conversation_id: ConversationId) {
        info!(conversation_id = %conversation_id, "Shortcut reported used");
    }
}

/// Log-only badge updater for headless deployments.
pub struct LoggingBadge;

#[async_trait]
impl BadgeUpdater for LoggingBadge {
    async fn refresh(&self) {
        info!("Badge refreshed");
    }
}
