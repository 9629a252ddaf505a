use std::time::Duration;

use axum::response::sse::{Event, KeepAlive};
use chrono_tz::Tz;
use metrics::counter;
use safebox_core::notification::Viewer;
use safebox_core::types::Notification;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

use crate::notifications::NotificationView;

const HUB_BUFFER: usize = 128;
const EVENT_NAME: &str = "notification";

/// Fan-out of freshly stored notifications to open event streams.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_BUFFER);
        Self { sender }
    }

    /// Counts and forwards a stored notification. Having no listeners is not an error.
    pub fn publish(&self, notification: Notification) {
        counter!("notifications_created_total", "kind" => notification.kind.as_str()).increment(1);
        if self.sender.send(notification).is_err() {
            debug!(stage = "notify", "no open notification streams");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

/// Events for the notifications `viewer` is allowed to see. Lagged receivers skip ahead.
pub fn notification_stream(
    hub: &NotificationHub,
    viewer: Viewer,
    timezone: Tz,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(notification) if notification.is_visible_to(&viewer) => {
            let id = notification.id;
            let created_at = notification.created_at;
            let view = NotificationView::new(notification, created_at, timezone);
            Some(serde_json::to_string(&view).map(|data| {
                Event::default()
                    .event(EVENT_NAME)
                    .id(id.to_string())
                    .data(data)
            }))
        }
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}
