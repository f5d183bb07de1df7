use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bigquery::{AssetRecord, AssetStore, ParameterizedQuery, StoreError};
use crate::config::{anchored_pattern, BigQueryConfig, Config, TableRef, DEFAULT_IDENTIFIER_PATTERN};
use crate::slack::{DeliveryError, ResponseDelivery};
use crate::types::SlackMessage;

pub const TEST_SECRET: &str = "test-signing-secret";

pub fn test_config() -> Config {
    Config {
        signing_secret: TEST_SECRET.to_string(),
        signature_tolerance: Duration::from_secs(300),
        ack_deadline: Duration::from_millis(2500),
        lookup_timeout: Duration::from_secs(5),
        max_results: 5,
        identifier_pattern: anchored_pattern(DEFAULT_IDENTIFIER_PATTERN).unwrap(),
        response_url_prefix: "https://hooks.slack.com/".to_string(),
        instances_table: TableRef::new("inventory-prod", "asset_exports", "compute_instances")
            .unwrap(),
        status_table: TableRef::new("inventory-prod", "asset_exports", "status_checks").unwrap(),
        bigquery: BigQueryConfig {
            project_id: "inventory-prod".to_string(),
            location: None,
            access_token: Some("unused".to_string()),
            api_base: "http://127.0.0.1:9".to_string(),
        },
        port: 0,
    }
}

pub fn instance_record(name: &str) -> AssetRecord {
    [
        ("instance_id", Some("4738291047382910")),
        ("instance_name", Some(name)),
        ("project_id", Some("inventory-prod")),
        ("status", Some("RUNNING")),
        ("zone", Some("us-central1-a")),
        ("machine_type", Some("e2-medium")),
        ("creation_timestamp", Some("1.700000005E9")),
    ]
    .into_iter()
    .collect()
}

/// In-memory store that records every query it is asked to run.
pub struct FakeStore {
    records: Vec<AssetRecord>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_query: Mutex<Option<ParameterizedQuery>>,
}

impl FakeStore {
    pub fn with_records(records: Vec<AssetRecord>) -> Self {
        Self {
            records,
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
            last_query: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_records(Vec::new())
        }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<ParameterizedQuery> {
        self.last_query.lock().unwrap().clone()
    }

    pub fn last_sql(&self) -> Option<String> {
        self.last_query().map(|q| q.sql().to_string())
    }
}

#[async_trait]
impl AssetStore for FakeStore {
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<AssetRecord>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(StoreError::Api {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }
        Ok(self.records.clone())
    }
}

/// Delivery that forwards each delayed reply to a channel.
pub struct RecordingDelivery {
    sender: mpsc::UnboundedSender<(String, SlackMessage)>,
}

impl RecordingDelivery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, SlackMessage)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ResponseDelivery for RecordingDelivery {
    async fn deliver(
        &self,
        response_url: &str,
        message: &SlackMessage,
    ) -> Result<(), DeliveryError> {
        let _ = self.sender.send((response_url.to_string(), message.clone()));
        Ok(())
    }
}
