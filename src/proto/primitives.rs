use std::str::FromStr;

use bitcoin::Txid;
use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

// The amount suffix representing Satoshi.
const SAT_SUFFIX: &str = "_sat";
// The amount suffix representing MilliSatoshi.
const MSAT_SUFFIX: &str = "_msat";
const MSAT_PER_SAT: u64 = 1000;

/// A monetary amount in millisatoshis. Serialized as a `String` with a suffix
/// `_msat` (or parsed from `_sat`) and internally represented as a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Msat(pub u64);

impl Msat {
    /// Constructs a new `Msat` struct from a `u64`.
    pub const fn from_msat(msat: u64) -> Self {
        Msat(msat)
    }

    /// Constructs a new `Msat` from whole satoshis, `None` on overflow.
    pub fn from_sat(sat: u64) -> Option<Self> {
        sat.checked_mul(MSAT_PER_SAT).map(Msat)
    }

    /// Returns the sat amount of the field. Is a floored integer division e.g
    /// 100678 becomes 100.
    pub fn to_sats_floor(&self) -> u64 {
        self.0 / MSAT_PER_SAT
    }

    /// Returns the msat value as `u64`. Is the inner value of `Msat`.
    pub fn msat(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Msat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_msat", self.0)
    }
}

impl Serialize for Msat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}_msat", self.0))
    }
}

struct MsatVisitor;

impl<'de> Visitor<'de> for MsatVisitor {
    type Value = Msat;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        formatter.write_str("a string formatted as '<numeric_value>_sat' or '<numeric_value>_msat'")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        if let Some(stripped) = value.strip_suffix(MSAT_SUFFIX) {
            let msat = stripped.parse::<u64>().map_err(|e| {
                Error::custom(format!(
                    "Failed to parse '{}' as u64 (from '{}'): {}",
                    stripped, value, e
                ))
            })?;
            return Ok(Msat(msat));
        }

        if let Some(stripped) = value.strip_suffix(SAT_SUFFIX) {
            let num_sats = stripped.parse::<u64>().map_err(|e| {
                Error::custom(format!(
                    "Failed to parse '{}' as u64 (from '{}'): {}",
                    stripped, value, e
                ))
            })?;
            return Msat::from_sat(num_sats).ok_or_else(|| {
                Error::custom(format!(
                    "Satoshi value '{}' too large, results in millisatoshi overflow",
                    num_sats
                ))
            });
        }

        Err(Error::custom(format!(
            "Expected string ending with '{}' or '{}', found: '{}'",
            SAT_SUFFIX, MSAT_SUFFIX, value
        )))
    }
}

impl<'de> Deserialize<'de> for Msat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(MsatVisitor)
    }
}

/// Parse a 64 hex char string into [u8; 32].
pub fn parse_hex32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// The 32-byte payment hash an HTLC is locked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PaymentHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s)
            .map(PaymentHash)
            .ok_or_else(|| anyhow::anyhow!("payment hash must be 64 hex chars, got '{}'", s))
    }
}

impl Serialize for PaymentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PaymentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PaymentHash::from_str(&s).map_err(|e| Error::custom(e.to_string()))
    }
}

/// The funding outpoint of a channel: `<funding_txid>:<output_index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelPoint {
    pub funding_txid: Txid,
    pub output_index: u32,
}

impl ChannelPoint {
    pub fn new(funding_txid: Txid, output_index: u32) -> Self {
        Self {
            funding_txid,
            output_index,
        }
    }
}

impl std::fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.funding_txid, self.output_index)
    }
}

impl FromStr for ChannelPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("channel point '{}' is missing ':'", s))?;
        let funding_txid = Txid::from_str(txid)
            .map_err(|e| anyhow::anyhow!("invalid funding txid '{}': {}", txid, e))?;
        let output_index = index
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("invalid output index '{}': {}", index, e))?;
        Ok(ChannelPoint::new(funding_txid, output_index))
    }
}

impl Serialize for ChannelPoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct ChannelPointVisitor;

impl<'de> Visitor<'de> for ChannelPointVisitor {
    type Value = ChannelPoint;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        formatter.write_str("a string formatted as '<funding_txid>:<output_index>'")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        ChannelPoint::from_str(value).map_err(|e| Error::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for ChannelPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(ChannelPointVisitor)
    }
}

/// BOLT 4 failure codes the interceptor reports back upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FailureCode {
    /// UPDATE | 7
    TemporaryChannelFailure = 0x1007,
    /// PERM | 15
    IncorrectOrUnknownPaymentDetails = 0x4015,
}

impl FailureCode {
    /// The on-the-wire failure code.
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::TemporaryChannelFailure => write!(f, "temporary_channel_failure"),
            FailureCode::IncorrectOrUnknownPaymentDetails => {
                write!(f, "incorrect_or_unknown_payment_details")
            }
        }
    }
}
