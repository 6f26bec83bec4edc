use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};

use crate::proto::{
    model::{OpenChannelRequest, PaymentInfo},
    primitives::{ChannelPoint, Msat, PaymentHash},
};

#[async_trait]
pub trait PaymentInfoLookup: Send + Sync {
    /// Resolves a payment hash to its registered payment. Unknown hashes are
    /// an error.
    async fn payment_info(&self, payment_hash: &PaymentHash) -> Result<PaymentInfo>;
}

#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint>;
    async fn is_connected(&self, peer_id: &PublicKey) -> Result<bool>;
}

#[async_trait]
pub trait FundingLinkStore: Send + Sync {
    async fn persist_funding_link(
        &self,
        payment_hash: &PaymentHash,
        channel_point: &ChannelPoint,
    ) -> Result<()>;
}

// ============================================================================
// Operator Notifications
// ============================================================================

/// Sent to the operator whenever a just-in-time channel was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenedNotification {
    pub payment_hash: PaymentHash,
    pub incoming_amount_msat: Msat,
    pub destination: PublicKey,
    pub capacity_sat: u64,
    pub channel_point: String,
    pub opened_at: DateTime<Utc>,
}

/// Trait for telling the operator about opened channels.
///
/// Notifications are fire-and-forget: implementations swallow and log their
/// own failures and should return quickly.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, notification: ChannelOpenedNotification);
}

/// Notifier that discards all notifications.
#[derive(Debug, Clone, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl OperatorNotifier for NoOpNotifier {
    async fn notify(&self, _notification: ChannelOpenedNotification) {}
}

/// Notifier that writes each notification to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, n: ChannelOpenedNotification) {
        log::info!(
            "JIT channel opened: payment_hash={}, incoming={}, destination={}, capacity={}sat, channel_point={}, at={}",
            n.payment_hash,
            n.incoming_amount_msat,
            n.destination,
            n.capacity_sat,
            n.channel_point,
            n.opened_at.to_rfc3339()
        );
    }
}

// ============================================================================
// Session Keys
// ============================================================================

/// Source of ephemeral onion session keys.
pub trait SessionKeySource: Send + Sync {
    fn session_key(&self) -> Result<SecretKey>;
}

/// Draws session keys from the operating system's CSPRNG.
#[derive(Debug, Clone, Default)]
pub struct OsRngSessionKeys;

impl SessionKeySource for OsRngSessionKeys {
    fn session_key(&self) -> Result<SecretKey> {
        // out-of-range draws are rejected by from_slice
        for _ in 0..4 {
            let mut bytes = [0u8; 32];
            OsRng
                .try_fill_bytes(&mut bytes)
                .with_context(|| "reading session key entropy")?;
            if let Ok(key) = SecretKey::from_slice(&bytes) {
                return Ok(key);
            }
        }
        anyhow::bail!("could not draw a valid session key")
    }
}

/// Always hands out the same session key. Only for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedSessionKey(pub SecretKey);

impl SessionKeySource for FixedSessionKey {
    fn session_key(&self) -> Result<SecretKey> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_rng_session_keys_differ() {
        let keys = OsRngSessionKeys;
        let a = keys.session_key().unwrap();
        let b = keys.session_key().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fixed_session_key() {
        let sk = SecretKey::from_slice(&[0x41; 32]).unwrap();
        let keys = FixedSessionKey(sk);
        assert_eq!(keys.session_key().unwrap(), sk);
        assert_eq!(keys.session_key().unwrap(), sk);
    }

    #[tokio::test]
    async fn test_notifiers_accept_notifications() {
        let n = ChannelOpenedNotification {
            payment_hash: PaymentHash([7u8; 32]),
            incoming_amount_msat: Msat(2_000_000),
            destination: "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
                .parse()
                .unwrap(),
            capacity_sat: 102_000,
            channel_point: "00".repeat(32) + ":0",
            opened_at: Utc::now(),
        };
        LogNotifier.notify(n.clone()).await;
        NoOpNotifier.notify(n).await;
    }
}
