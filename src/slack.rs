use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

use crate::types::SlackMessage;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Slack-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Slack-Request-Timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("request timestamp is not a unix time")]
    MalformedTimestamp,
    #[error("request timestamp is outside the replay window")]
    Expired,
    #[error("signature does not match")]
    Mismatch,
}

/// Computes the `v0=` signature Slack attaches to a request.
pub fn compute_signature(signing_secret: &str, timestamp: &str, raw_body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a Slack request signature against the clock reading `now_secs`.
///
/// Requests whose timestamp differs from `now_secs` by more than `tolerance`
/// are rejected even when the signature itself is valid.
pub fn verify_signature(
    signing_secret: &str,
    timestamp: &str,
    signature: &[u8],
    raw_body: &[u8],
    now_secs: u64,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let ts: u64 = timestamp
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp)?;

    if now_secs.abs_diff(ts) > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let computed = compute_signature(signing_secret, timestamp, raw_body);

    if !constant_time_eq(signature, computed.as_bytes()) {
        return Err(SignatureError::Mismatch);
    }

    Ok(())
}

/// Verifies a request against the system clock.
pub fn verify_signature_now(
    signing_secret: &str,
    timestamp: &str,
    signature: &[u8],
    raw_body: &[u8],
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    verify_signature(signing_secret, timestamp, signature, raw_body, now, tolerance)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request to response_url failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("response_url rejected the message: {status} - {body}")]
    Rejected { status: u16, body: String },
}

/// Sends a delayed reply to the `response_url` of a slash command.
#[async_trait]
pub trait ResponseDelivery: Send + Sync {
    async fn deliver(&self, response_url: &str, message: &SlackMessage)
        -> Result<(), DeliveryError>;
}

pub struct ResponseUrlClient {
    client: reqwest::Client,
}

impl ResponseUrlClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ResponseDelivery for ResponseUrlClient {
    async fn deliver(
        &self,
        response_url: &str,
        message: &SlackMessage,
    ) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(response_url)
            .header("Content-Type", "application/json")
            .json(message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("response_url returned {}", status);
            return Err(DeliveryError::Rejected { status, body });
        }

        Ok(())
    }
}
