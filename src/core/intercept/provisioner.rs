use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use chrono::Utc;

use super::provider::{ChannelOpenedNotification, FundingLinkStore, LightningClient, OperatorNotifier};
use crate::options::InterceptConfig;
use crate::proto::{
    model::OpenChannelRequest,
    primitives::{ChannelPoint, Msat, PaymentHash},
};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to open channel: {0}")]
    Open(#[source] anyhow::Error),
    #[error("channel open timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel {channel_point} opened but its funding link was not persisted: {source}")]
    LinkNotPersisted {
        channel_point: ChannelPoint,
        #[source]
        source: anyhow::Error,
    },
}

/// Sizes a just-in-time channel for `incoming`.
///
/// Never returns `public_channel_amount_sat` so JIT channels are told apart
/// from our public ones by capacity alone.
pub fn channel_capacity_sat(
    incoming: Msat,
    additional_capacity_sat: u64,
    public_channel_amount_sat: u64,
) -> u64 {
    let capacity = incoming.to_sats_floor().saturating_add(additional_capacity_sat);
    if capacity == public_channel_amount_sat {
        capacity + 1
    } else {
        capacity
    }
}

/// Opens the channel for a payment and records it.
#[derive(Clone)]
pub struct ChannelProvisioner {
    client: Arc<dyn LightningClient>,
    link_store: Arc<dyn FundingLinkStore>,
    notifier: Arc<dyn OperatorNotifier>,
    additional_capacity_sat: u64,
    public_channel_amount_sat: u64,
    target_conf: u32,
    open_timeout: Duration,
    persist_timeout: Duration,
    notify_timeout: Duration,
}

impl ChannelProvisioner {
    pub fn new(
        client: Arc<dyn LightningClient>,
        link_store: Arc<dyn FundingLinkStore>,
        notifier: Arc<dyn OperatorNotifier>,
        config: &InterceptConfig,
    ) -> Self {
        Self {
            client,
            link_store,
            notifier,
            additional_capacity_sat: config.additional_channel_capacity_sat,
            public_channel_amount_sat: config.public_channel_amount_sat,
            target_conf: config.target_conf,
            open_timeout: config.open_channel_timeout,
            persist_timeout: config.lookup_timeout,
            notify_timeout: config.notify_timeout,
        }
    }

    pub fn capacity_for(&self, incoming: Msat) -> u64 {
        channel_capacity_sat(
            incoming,
            self.additional_capacity_sat,
            self.public_channel_amount_sat,
        )
    }

    pub async fn provision(
        &self,
        payment_hash: &PaymentHash,
        destination: &PublicKey,
        incoming: Msat,
    ) -> Result<ChannelPoint, ProvisionError> {
        let request = OpenChannelRequest {
            destination: *destination,
            capacity_sat: self.capacity_for(incoming),
            target_conf: self.target_conf,
            is_private: true,
            is_zero_conf: true,
        };

        log::debug!(
            "Opening channel to {} with capacity {}sat for payment_hash={}",
            destination,
            request.capacity_sat,
            payment_hash
        );

        let channel_point =
            match tokio::time::timeout(self.open_timeout, self.client.open_channel(&request)).await
            {
                Ok(Ok(cp)) => cp,
                Ok(Err(e)) => {
                    log::error!(
                        "Failed to open channel to {} (capacity {}sat, payment_hash={}): {:#}",
                        destination,
                        request.capacity_sat,
                        payment_hash,
                        e
                    );
                    return Err(ProvisionError::Open(e));
                }
                Err(_) => {
                    log::error!(
                        "Opening channel to {} timed out after {:?} (payment_hash={})",
                        destination,
                        self.open_timeout,
                        payment_hash
                    );
                    return Err(ProvisionError::Timeout(self.open_timeout));
                }
            };

        log::info!(
            "Opened channel {} to {} for payment_hash={}",
            channel_point,
            destination,
            payment_hash
        );

        self.notify_detached(ChannelOpenedNotification {
            payment_hash: *payment_hash,
            incoming_amount_msat: incoming,
            destination: *destination,
            capacity_sat: request.capacity_sat,
            channel_point: channel_point.to_string(),
            opened_at: Utc::now(),
        });

        let persisted = tokio::time::timeout(
            self.persist_timeout,
            self.link_store
                .persist_funding_link(payment_hash, &channel_point),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "persisting funding link timed out after {:?}",
                self.persist_timeout
            ))
        });

        if let Err(source) = persisted {
            log::error!(
                "Orphaned channel {}: funding link for payment_hash={} not persisted: {:#}",
                channel_point,
                payment_hash,
                source
            );
            return Err(ProvisionError::LinkNotPersisted {
                channel_point,
                source,
            });
        }

        Ok(channel_point)
    }

    /// Hands the notification to its own task so a slow notifier never holds
    /// up the HTLC or the provisioning lock.
    fn notify_detached(&self, notification: ChannelOpenedNotification) {
        let notifier = self.notifier.clone();
        let limit = self.notify_timeout;
        tokio::spawn(async move {
            let payment_hash = notification.payment_hash;
            let channel_point = notification.channel_point.clone();
            if tokio::time::timeout(limit, notifier.notify(notification))
                .await
                .is_err()
            {
                log::warn!(
                    "Dropped channel-opened notification for {} (payment_hash={}) after {:?}",
                    channel_point,
                    payment_hash,
                    limit
                );
            }
        });
    }
}
