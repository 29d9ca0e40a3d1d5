//! Alert ingress: validation, queue admission, chain selection, session
//! creation.

use std::sync::Arc;

use tarsy_domain::alert::Alert;
use tarsy_domain::config::Settings;
use tarsy_domain::error::Error;
use tarsy_domain::event::{channels, EventPayload};
use tarsy_domain::masking::DataMasker;
use tarsy_domain::session::AlertSession;
use tarsy_domain::timestamp::new_id;
use tarsy_domain::Result;
use tarsy_events::EventBus;
use tarsy_store::Store;

use crate::registry::ChainRegistry;

pub const DEFAULT_AUTHOR: &str = "api-client";

pub struct AlertService {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    chains: Arc<ChainRegistry>,
    settings: Arc<Settings>,
    masker: Option<DataMasker>,
}

impl AlertService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        chains: Arc<ChainRegistry>,
        settings: Arc<Settings>,
    ) -> Self {
        let masker = settings
            .alert_data_masking_enabled
            .then(DataMasker::with_all_builtins);
        Self {
            store,
            bus,
            chains,
            settings,
            masker,
        }
    }

    /// Admit one alert: validate, check the queue cap, snapshot the chain,
    /// create the PENDING session, and announce it.
    pub async fn submit(&self, mut alert: Alert, author: Option<String>) -> Result<AlertSession> {
        alert.validate()?;

        let chain = self
            .chains
            .chain_for_alert_type(&alert.alert_type)
            .ok_or_else(|| {
                Error::Validation(format!("no chain handles alert type '{}'", alert.alert_type))
            })?;

        if let Some(max_queue_size) = self.settings.queue_cap() {
            let queue_size = self.store.count_pending_sessions().await? as usize;
            if queue_size >= max_queue_size {
                return Err(Error::QueueFull {
                    queue_size,
                    max_queue_size,
                });
            }
        }

        if let Some(masker) = &self.masker {
            alert.data = masker.mask_value(&alert.data);
        }

        let alert_id = format!("{}-{}", alert.alert_type, new_id());
        let session = AlertSession::pending(
            &alert,
            alert_id,
            &chain.chain_id,
            chain.to_value(),
            author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
        );
        self.store.create_session(&session).await?;

        // The session row is the durable fact; a failed announcement only
        // costs dashboard latency.
        if let Err(e) = self
            .bus
            .publish(
                channels::SESSIONS,
                &EventPayload::SessionCreated {
                    session_id: session.session_id.clone(),
                    alert_type: session.alert_type.clone(),
                },
            )
            .await
        {
            tracing::warn!(session_id = %session.session_id, error = %e, "session.created publish failed");
        }

        tracing::info!(
            session_id = %session.session_id,
            alert_type = %session.alert_type,
            chain_id = %session.chain_id,
            author = %session.author,
            "alert admitted"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tarsy_domain::config::Config;
    use tarsy_events::PollingEventBus;
    use tarsy_store::MemoryStore;

    fn alert() -> Alert {
        Alert {
            alert_type: "kubernetes".into(),
            runbook: Some("https://example/rb.md".into()),
            severity: None,
            timestamp: None,
            data: serde_json::json!({"namespace": "prod", "password=hunter2": "x"}),
            mcp: None,
        }
    }

    fn service(settings: Settings) -> (AlertService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(PollingEventBus::new(
            store.clone() as Arc<dyn Store>,
            Duration::from_millis(20),
        ));
        let chains = Arc::new(ChainRegistry::from_config(&Config::default()).unwrap());
        (
            AlertService::new(store.clone(), bus, chains, Arc::new(settings)),
            store,
        )
    }

    #[tokio::test]
    async fn submit_creates_pending_session_and_event() {
        let (service, store) = service(Settings::default());
        let session = service.submit(alert(), None).await.unwrap();

        assert_eq!(session.author, DEFAULT_AUTHOR);
        assert_eq!(session.chain_id, "kubernetes-chain");
        let stored = store.get_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, tarsy_domain::status::SessionStatus::Pending);

        let events = store.get_events_after(channels::SESSIONS, 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["type"], "session.created");
    }

    #[tokio::test]
    async fn forwarded_author_wins() {
        let (service, _) = service(Settings::default());
        let session = service
            .submit(alert(), Some("oncall@example.com".into()))
            .await
            .unwrap();
        assert_eq!(session.author, "oncall@example.com");
    }

    #[tokio::test]
    async fn unknown_alert_type_is_validation_error() {
        let (service, _) = service(Settings::default());
        let mut bad = alert();
        bad.alert_type = "totally-unknown".into();
        assert!(matches!(
            service.submit(bad, None).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn queue_full_refuses_admission() {
        let mut settings = Settings::default();
        settings.max_queue_size = Some(2);
        let (service, store) = service(settings);

        service.submit(alert(), None).await.unwrap();
        service.submit(alert(), None).await.unwrap();
        let err = service.submit(alert(), None).await.unwrap_err();
        match err {
            Error::QueueFull {
                queue_size,
                max_queue_size,
            } => {
                assert_eq!(queue_size, 2);
                assert_eq!(max_queue_size, 2);
            }
            other => panic!("expected QueueFull, got {other}"),
        }
        // No third session row was created.
        assert_eq!(store.count_pending_sessions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn alert_data_is_masked_at_ingestion() {
        let (service, _) = service(Settings::default());
        let mut noisy = alert();
        noisy.data = serde_json::json!({"env": "password: hunter2"});
        let session = service.submit(noisy, None).await.unwrap();
        let text = session.alert_data["env"].as_str().unwrap();
        assert!(!text.contains("hunter2"));
    }
}
