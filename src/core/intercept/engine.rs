use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;

use super::fee::InsufficientFee;
use super::locks::ProvisionLocks;
use super::onion::{OnionError, OnionRepacker};
use super::provider::{
    FundingLinkStore, LightningClient, OperatorNotifier, PaymentInfoLookup, SessionKeySource,
};
use super::provisioner::{ChannelProvisioner, ProvisionError};
use crate::options::InterceptConfig;
use crate::proto::{
    model::{InterceptedHtlc, PaymentInfo},
    primitives::{ChannelPoint, FailureCode, Msat, PaymentHash},
};

/// What the node runtime should do with an intercepted HTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptVerdict {
    /// Forward unchanged.
    Resume,
    /// Forward over `channel_point` with a rewritten amount and onion, fail
    /// back if that is impossible.
    ResumeOrFail {
        destination: PublicKey,
        channel_point: ChannelPoint,
        amount_msat: Msat,
        onion_blob: Vec<u8>,
    },
    FailGeneric,
    FailWithCode(FailureCode),
}

/// Result of asking the node whether a peer is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReachability {
    Connected,
    Disconnected,
    /// The check itself failed or timed out.
    Unknown,
}

impl PeerReachability {
    /// Failure code returned to a probing payer.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            PeerReachability::Connected => FailureCode::TemporaryChannelFailure,
            PeerReachability::Disconnected | PeerReachability::Unknown => {
                FailureCode::IncorrectOrUnknownPaymentDetails
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("incoming amount is zero")]
    ZeroIncoming,
    #[error("scaled amount overflows u64")]
    Overflow,
}

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("payment info lookup failed: {0}")]
    Lookup(#[source] anyhow::Error),
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),
    #[error("probe rejected with {code} (peer {reachability:?})")]
    ProbeRejected {
        reachability: PeerReachability,
        code: FailureCode,
    },
    #[error("failed to build onion: {0}")]
    CryptoBuild(#[from] OnionError),
    #[error("failed to scale amount: {0}")]
    Amount(#[from] AmountError),
}

impl InterceptError {
    pub fn verdict(&self) -> InterceptVerdict {
        match self {
            InterceptError::ProbeRejected { code, .. } => InterceptVerdict::FailWithCode(*code),
            InterceptError::Lookup(_)
            | InterceptError::Provisioning(_)
            | InterceptError::CryptoBuild(_)
            | InterceptError::Amount(_) => InterceptVerdict::FailGeneric,
        }
    }
}

/// Scales the registered outgoing amount by the share of the payment this
/// HTLC carries: `outgoing * requested / incoming`, truncated.
pub fn scale_amount(outgoing: Msat, requested: Msat, incoming: Msat) -> Result<Msat, AmountError> {
    if incoming.msat() == 0 {
        return Err(AmountError::ZeroIncoming);
    }
    let scaled = outgoing.msat() as u128 * requested.msat() as u128 / incoming.msat() as u128;
    u64::try_from(scaled)
        .map(Msat)
        .map_err(|_| AmountError::Overflow)
}

/// Decides the fate of every intercepted HTLC.
pub struct InterceptionEngine {
    lookup: Arc<dyn PaymentInfoLookup>,
    client: Arc<dyn LightningClient>,
    provisioner: ChannelProvisioner,
    repacker: OnionRepacker,
    locks: ProvisionLocks,
    config: InterceptConfig,
}

impl InterceptionEngine {
    pub fn new(
        lookup: Arc<dyn PaymentInfoLookup>,
        client: Arc<dyn LightningClient>,
        link_store: Arc<dyn FundingLinkStore>,
        notifier: Arc<dyn OperatorNotifier>,
        key_source: Arc<dyn SessionKeySource>,
        config: InterceptConfig,
    ) -> Self {
        let provisioner = ChannelProvisioner::new(client.clone(), link_store, notifier, &config);
        Self {
            lookup,
            client,
            provisioner,
            repacker: OnionRepacker::new(key_source),
            locks: ProvisionLocks::new(),
            config,
        }
    }

    pub async fn decide(&self, htlc: &InterceptedHtlc) -> InterceptVerdict {
        match self.try_decide(htlc).await {
            Ok(verdict) => verdict,
            Err(e) => {
                log::debug!(
                    "Intercepted HTLC payment_hash={} resolved by error: {}",
                    htlc.payment_hash,
                    e
                );
                e.verdict()
            }
        }
    }

    /// Checks that `info` leaves us at least the configured fee.
    pub fn check_fee(&self, info: &PaymentInfo) -> Result<(), InsufficientFee> {
        self.config
            .fee_policy
            .validate(info.incoming_amount_msat, info.outgoing_amount_msat)
            .inspect_err(|e| {
                log::warn!(
                    "Payment payment_hash={} to {} rejected: {}",
                    info.payment_hash,
                    info.destination,
                    e
                )
            })
    }

    async fn try_decide(&self, htlc: &InterceptedHtlc) -> Result<InterceptVerdict, InterceptError> {
        let info = self.lookup_payment(&htlc.payment_hash).await?;
        log::debug!(
            "Intercepted payment_hash={}: destination={}, incoming={}, outgoing={}, requested={}, expiry={}",
            htlc.payment_hash,
            info.destination,
            info.incoming_amount_msat,
            info.outgoing_amount_msat,
            htlc.outgoing_amount_msat,
            htlc.outgoing_expiry
        );

        let Some(payment_secret) = info.payment_secret else {
            return Ok(InterceptVerdict::Resume);
        };

        let channel_point = match info.channel_point {
            Some(cp) => cp,
            None if info.payment_hash == htlc.payment_hash => self.ensure_channel(&info).await?,
            None => return Err(self.reject_probe(htlc, &info).await),
        };

        let amount_msat = scale_amount(
            info.outgoing_amount_msat,
            htlc.outgoing_amount_msat,
            info.incoming_amount_msat,
        )
        .inspect_err(|e| {
            log::error!(
                "step=scale_amount payment_hash={} outgoing={} requested={} incoming={}: {}",
                htlc.payment_hash,
                info.outgoing_amount_msat,
                htlc.outgoing_amount_msat,
                info.incoming_amount_msat,
                e
            )
        })?;

        let packet = self
            .repacker
            .build(
                &info.destination,
                amount_msat,
                info.outgoing_amount_msat,
                htlc.outgoing_expiry,
                &payment_secret,
                &htlc.payment_hash,
            )
            .inspect_err(|e| {
                log::error!(
                    "step=build_onion payment_hash={} destination={} amount={}: {}",
                    htlc.payment_hash,
                    info.destination,
                    amount_msat,
                    e
                )
            })?;

        log::info!(
            "Rerouting payment_hash={} over {} to {} with amount {}",
            htlc.payment_hash,
            channel_point,
            info.destination,
            amount_msat
        );

        Ok(InterceptVerdict::ResumeOrFail {
            destination: info.destination,
            channel_point,
            amount_msat,
            onion_blob: packet.blob,
        })
    }

    async fn lookup_payment(&self, payment_hash: &PaymentHash) -> Result<PaymentInfo, InterceptError> {
        let res = tokio::time::timeout(
            self.config.lookup_timeout,
            self.lookup.payment_info(payment_hash),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "lookup timed out after {:?}",
                self.config.lookup_timeout
            ))
        });

        res.map_err(|e| {
            log::error!(
                "paymentInfo({}) error: {:#}",
                hex::encode(payment_hash.as_bytes()),
                e
            );
            InterceptError::Lookup(e)
        })
    }

    /// Provisions the channel for `info` unless a concurrent interception
    /// already did.
    async fn ensure_channel(&self, info: &PaymentInfo) -> Result<ChannelPoint, InterceptError> {
        let _guard = self.locks.lock(&info.payment_hash).await;

        let fresh = self.lookup_payment(&info.payment_hash).await?;
        if let Some(cp) = fresh.channel_point {
            log::debug!(
                "Channel {} already provisioned for payment_hash={}",
                cp,
                info.payment_hash
            );
            return Ok(cp);
        }

        Ok(self
            .provisioner
            .provision(&info.payment_hash, &info.destination, info.incoming_amount_msat)
            .await?)
    }

    async fn reject_probe(&self, htlc: &InterceptedHtlc, info: &PaymentInfo) -> InterceptError {
        let reachability = match tokio::time::timeout(
            self.config.lookup_timeout,
            self.client.is_connected(&info.destination),
        )
        .await
        {
            Ok(Ok(true)) => PeerReachability::Connected,
            Ok(Ok(false)) => PeerReachability::Disconnected,
            Ok(Err(e)) => {
                log::warn!(
                    "Connectivity check for {} failed, treating as unreachable: {:#}",
                    info.destination,
                    e
                );
                PeerReachability::Unknown
            }
            Err(_) => {
                log::warn!(
                    "Connectivity check for {} timed out, treating as unreachable",
                    info.destination
                );
                PeerReachability::Unknown
            }
        };

        let code = reachability.failure_code();
        log::info!(
            "Probe payment_hash={} for payment_hash={} to {} ({:?}), failing with {}",
            htlc.payment_hash,
            info.payment_hash,
            info.destination,
            reachability,
            code
        );
        InterceptError::ProbeRejected { reachability, code }
    }
}
