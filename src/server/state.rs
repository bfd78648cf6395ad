use std::sync::Arc;
use std::time::Instant;

use crate::auth::{AuthCoordinator, Authenticator};
use crate::config::Settings;
use crate::hub::SignalingHub;
use crate::websocket::PeerRouter;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: Arc<SignalingHub>,
    pub coordinator: Arc<AuthCoordinator>,
    pub router: Arc<PeerRouter>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, authenticator: Arc<dyn Authenticator>) -> Self {
        let hub = Arc::new(SignalingHub::new(&settings.signaling, authenticator));
        let coordinator = Arc::new(AuthCoordinator::new(hub.clone()));
        let router = Arc::new(PeerRouter::new(hub.clone(), coordinator.clone()));

        Self {
            settings: Arc::new(settings),
            hub,
            coordinator,
            router,
            start_time: Instant::now(),
        }
    }
}
