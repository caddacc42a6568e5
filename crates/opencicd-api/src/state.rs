//! Application state.

use opencicd_config::SystemConfig;
use opencicd_core::Result;
use opencicd_core::clock::Clock;
use opencicd_db::Store;
use opencicd_scheduler::ControlPlane;
use std::sync::Arc;

use crate::delivery::MailboxDelivery;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub mailbox: Arc<MailboxDelivery>,
}

impl AppState {
    pub async fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: SystemConfig,
    ) -> Result<Self> {
        let mailbox = Arc::new(MailboxDelivery::new());
        let plane = ControlPlane::new(store, mailbox.clone(), clock, config).await?;
        Ok(Self {
            plane: Arc::new(plane),
            mailbox,
        })
    }
}
