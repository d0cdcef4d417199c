use crate::api::ApiContext;
use shared::protocol::QueueEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<QueueEvent>,
}

impl AppState {
    pub(crate) fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}
