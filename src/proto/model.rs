use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::primitives::{parse_hex32, ChannelPoint, Msat, PaymentHash};

/// An HTLC the node runtime intercepted on its way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptedHtlc {
    pub payment_hash: PaymentHash,
    pub outgoing_amount_msat: Msat,
    /// Absolute block height the outgoing HTLC expires at
    pub outgoing_expiry: u32,
}

impl InterceptedHtlc {
    pub fn new(payment_hash: PaymentHash, outgoing_amount_msat: Msat, outgoing_expiry: u32) -> Self {
        Self {
            payment_hash,
            outgoing_amount_msat,
            outgoing_expiry,
        }
    }
}

/// What we know about a registered payment.
///
/// A `payment_secret` marks the payment as needing a just-in-time channel to
/// `destination`; a `channel_point` means that channel was already opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub payment_hash: PaymentHash,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "to_hex32",
        deserialize_with = "from_hex32"
    )]
    pub payment_secret: Option<[u8; 32]>,
    pub destination: PublicKey,
    pub incoming_amount_msat: Msat,
    pub outgoing_amount_msat: Msat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_point: Option<ChannelPoint>,
}

/// Parameters for opening a channel towards a payment's destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelRequest {
    pub destination: PublicKey,
    pub capacity_sat: u64,
    /// Confirmation target used for the funding fee estimate
    pub target_conf: u32,
    pub is_private: bool,
    pub is_zero_conf: bool,
}

fn to_hex32<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match bytes {
        Some(data) => serializer.serialize_str(&hex::encode(data)),
        None => serializer.serialize_none(),
    }
}

fn from_hex32<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex32(&s)
            .map(Some)
            .ok_or_else(|| Error::custom(format!("expected 64 hex chars, got '{}'", s))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_public_key() -> PublicKey {
        "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_payment_info_json() {
        let info = PaymentInfo {
            payment_hash: PaymentHash([1u8; 32]),
            payment_secret: Some([2u8; 32]),
            destination: test_public_key(),
            incoming_amount_msat: Msat(1_000_000),
            outgoing_amount_msat: Msat(900_000),
            channel_point: None,
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["payment_secret"], "02".repeat(32));
        assert_eq!(json["incoming_amount_msat"], "1000000_msat");
        assert_eq!(
            json["destination"],
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
        assert!(json.get("channel_point").is_none());

        let back: PaymentInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.payment_secret, Some([2u8; 32]));
    }

    #[test]
    fn test_payment_info_without_secret() {
        let json = serde_json::json!({
            "payment_hash": "01".repeat(32),
            "destination": "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
            "incoming_amount_msat": "1000_sat",
            "outgoing_amount_msat": "900000_msat",
        });
        let info: PaymentInfo = serde_json::from_value(json).unwrap();
        assert!(info.payment_secret.is_none());
        assert_eq!(info.incoming_amount_msat, Msat(1_000_000));
    }

    #[test]
    fn test_payment_info_rejects_short_secret() {
        let json = serde_json::json!({
            "payment_hash": "01".repeat(32),
            "payment_secret": "0202",
            "destination": "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
            "incoming_amount_msat": "1000_sat",
            "outgoing_amount_msat": "900000_msat",
        });
        assert!(serde_json::from_value::<PaymentInfo>(json).is_err());
    }
}
