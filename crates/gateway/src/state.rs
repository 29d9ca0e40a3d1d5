//! Shared state handed to every request handler.

use std::sync::Arc;

use tarsy_engine::background::McpHealthMonitor;
use tarsy_engine::{AlertService, SessionService, SystemWarnings};
use tarsy_events::EventBus;
use tarsy_store::Store;

use crate::ws::hub::WsHub;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub alerts: Arc<AlertService>,
    pub sessions: Arc<SessionService>,
    pub warnings: Arc<SystemWarnings>,
    pub mcp_health: Arc<McpHealthMonitor>,
    pub hub: Arc<WsHub>,
}
