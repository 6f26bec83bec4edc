use crate::{
    core::intercept::provider::{FundingLinkStore, LightningClient, PaymentInfoLookup},
    proto::{
        model::{OpenChannelRequest, PaymentInfo},
        primitives::{ChannelPoint, PaymentHash},
    },
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use cln_rpc::{
    model::{
        requests::{
            DatastoreMode, DatastoreRequest, FundchannelRequest, ListdatastoreRequest,
            ListpeersRequest,
        },
        responses::ListdatastoreResponse,
    },
    primitives::{Amount, AmountOrAll, Feerate},
    ClnRpc,
};
use core::fmt;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::str::FromStr;

pub const DS_MAIN_KEY: &str = "jitforward";
pub const DS_PAYMENT_KEY: &str = "payment";
pub const DS_FUNDING_KEY: &str = "funding";

/// Feature bits requested for zero-conf JIT channels
/// (static_remotekey, zero_conf, anchors).
const ZERO_CONF_CHANNEL_TYPE: [u32; 3] = [12, 46, 50];

#[derive(Clone)]
pub struct ClnApiRpc {
    rpc_path: PathBuf,
}

impl ClnApiRpc {
    pub fn new(rpc_path: PathBuf) -> Self {
        Self { rpc_path }
    }

    async fn create_rpc(&self) -> Result<ClnRpc> {
        ClnRpc::new(&self.rpc_path).await
    }

    fn payment_key(payment_hash: &PaymentHash) -> Vec<String> {
        vec![
            DS_MAIN_KEY.to_string(),
            DS_PAYMENT_KEY.to_string(),
            payment_hash.to_string(),
        ]
    }

    fn funding_key(payment_hash: &PaymentHash) -> Vec<String> {
        vec![
            DS_MAIN_KEY.to_string(),
            DS_FUNDING_KEY.to_string(),
            payment_hash.to_string(),
        ]
    }

    /// Registers a payment so later interceptions can find it. Fails if the
    /// hash is already registered.
    pub async fn store_payment_info(&self, info: &PaymentInfo) -> Result<()> {
        // the funding link lives under its own key
        let info = PaymentInfo {
            channel_point: None,
            ..info.clone()
        };
        let json_str = serde_json::to_string(&info)?;

        let mut rpc = self.create_rpc().await?;
        rpc.call_typed(&DatastoreRequest {
            generation: None,
            hex: None,
            mode: Some(DatastoreMode::MUST_CREATE),
            string: Some(json_str),
            key: Self::payment_key(&info.payment_hash),
        })
        .await
        .map_err(anyhow::Error::new)
        .with_context(|| "calling datastore")?;

        Ok(())
    }

    async fn list_entry<T>(&self, rpc: &mut ClnRpc, key: Vec<String>) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let res = rpc
            .call_typed(&ListdatastoreRequest {
                key: Some(key.clone()),
            })
            .await
            .with_context(|| "calling listdatastore")?;

        match deserialize_by_key::<T, _>(&res, key) {
            Ok((value, _)) => Ok(Some(value)),
            Err(DsError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PaymentInfoLookup for ClnApiRpc {
    async fn payment_info(&self, payment_hash: &PaymentHash) -> Result<PaymentInfo> {
        let mut rpc = self.create_rpc().await?;

        let mut info: PaymentInfo = self
            .list_entry(&mut rpc, Self::payment_key(payment_hash))
            .await?
            .ok_or_else(|| DsError::NotFound {
                key: Self::payment_key(payment_hash),
            })?;

        info.channel_point = self
            .list_entry(&mut rpc, Self::funding_key(payment_hash))
            .await?;

        Ok(info)
    }
}

#[async_trait]
impl FundingLinkStore for ClnApiRpc {
    async fn persist_funding_link(
        &self,
        payment_hash: &PaymentHash,
        channel_point: &ChannelPoint,
    ) -> Result<()> {
        let mut rpc = self.create_rpc().await?;
        let json_str = serde_json::to_string(channel_point)?;

        // MUST_CREATE keeps the first link authoritative
        rpc.call_typed(&DatastoreRequest {
            generation: None,
            hex: None,
            mode: Some(DatastoreMode::MUST_CREATE),
            string: Some(json_str),
            key: Self::funding_key(payment_hash),
        })
        .await
        .map_err(anyhow::Error::new)
        .with_context(|| format!("storing funding link {} for {}", channel_point, payment_hash))?;

        Ok(())
    }
}

#[async_trait]
impl LightningClient for ClnApiRpc {
    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint> {
        log::debug!(
            "open_channel: connecting to RPC socket at {:?}, peer={}, capacity={}sat",
            self.rpc_path,
            request.destination,
            request.capacity_sat
        );
        let mut rpc = self.create_rpc().await?;
        let res = rpc
            .call_typed(&FundchannelRequest {
                announce: Some(!request.is_private),
                close_to: None,
                compact_lease: None,
                feerate: Some(feerate_for_target(request.target_conf)),
                minconf: None,
                mindepth: request.is_zero_conf.then_some(0),
                push_msat: None,
                request_amt: None,
                reserve: None,
                channel_type: request
                    .is_zero_conf
                    .then(|| ZERO_CONF_CHANNEL_TYPE.to_vec()),
                utxos: None,
                amount: AmountOrAll::Amount(Amount::from_sat(request.capacity_sat)),
                id: request.destination,
            })
            .await
            .with_context(|| "calling fundchannel")?;
        log::debug!(
            "open_channel: fundchannel returned channel_id={}, txid={}, outnum={}",
            res.channel_id,
            res.txid,
            res.outnum
        );

        let txid = Txid::from_str(&res.txid)
            .with_context(|| format!("parsing txid '{}' from fundchannel response", res.txid))?;
        Ok(ChannelPoint::new(txid, res.outnum))
    }

    async fn is_connected(&self, peer_id: &PublicKey) -> Result<bool> {
        let mut rpc = self.create_rpc().await?;
        let res = rpc
            .call_typed(&ListpeersRequest {
                id: Some(peer_id.to_owned()),
                level: None,
            })
            .await
            .with_context(|| "calling listpeers")?;

        Ok(res.peers.iter().any(|p| p.connected))
    }
}

/// Maps a confirmation target onto CLN's named feerates.
fn feerate_for_target(target_conf: u32) -> Feerate {
    match target_conf {
        0..=2 => Feerate::Urgent,
        3..=6 => Feerate::Normal,
        _ => Feerate::Slow,
    }
}

#[derive(Debug)]
pub enum DsError {
    /// No datastore entry with this exact key.
    NotFound { key: Vec<String> },
    /// Entry existed but had neither `string` nor `hex`.
    MissingValue { key: Vec<String> },
    JsonParse {
        key: Vec<String>,
        source: serde_json::Error,
    },
    HexDecode {
        key: Vec<String>,
        source: hex::FromHexError,
    },
}

impl fmt::Display for DsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsError::NotFound { key } => write!(f, "no datastore entry for key {:?}", key),
            DsError::MissingValue { key } => write!(
                f,
                "datastore entry had neither `string` nor `hex` for key {:?}",
                key
            ),
            DsError::JsonParse { key, source } => {
                write!(f, "failed to parse JSON at key {:?}: {}", key, source)
            }
            DsError::HexDecode { key, source } => {
                write!(f, "failed to decode hex at key {:?}: {}", key, source)
            }
        }
    }
}

impl std::error::Error for DsError {}

/// Finds the entry stored under exactly `key` and parses its JSON value,
/// returning it with the entry's generation.
pub fn deserialize_by_key<T, K>(
    resp: &ListdatastoreResponse,
    key: K,
) -> std::result::Result<(T, Option<u64>), DsError>
where
    T: DeserializeOwned,
    K: AsRef<[String]>,
{
    let wanted: &[String] = key.as_ref();

    let ds = resp
        .datastore
        .iter()
        .find(|d| d.key.as_slice() == wanted)
        .ok_or_else(|| DsError::NotFound {
            key: wanted.to_vec(),
        })?;

    if let Some(s) = &ds.string {
        let value = serde_json::from_str::<T>(s).map_err(|e| DsError::JsonParse {
            key: ds.key.clone(),
            source: e,
        })?;
        return Ok((value, ds.generation));
    }

    if let Some(hx) = &ds.hex {
        let bytes = hex::decode(hx).map_err(|e| DsError::HexDecode {
            key: ds.key.clone(),
            source: e,
        })?;
        let value = serde_json::from_slice::<T>(&bytes).map_err(|e| DsError::JsonParse {
            key: ds.key.clone(),
            source: e,
        })?;
        return Ok((value, ds.generation));
    }

    Err(DsError::MissingValue {
        key: ds.key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listdatastore(entries: serde_json::Value) -> ListdatastoreResponse {
        serde_json::from_value(json!({ "datastore": entries })).unwrap()
    }

    fn funding_key() -> Vec<String> {
        ClnApiRpc::funding_key(&PaymentHash([0xab; 32]))
    }

    #[test]
    fn test_keys() {
        let hash = PaymentHash([0xab; 32]);
        assert_eq!(
            ClnApiRpc::payment_key(&hash),
            vec!["jitforward".to_string(), "payment".to_string(), "ab".repeat(32)]
        );
        assert_eq!(ClnApiRpc::funding_key(&hash)[1], "funding");
    }

    #[test]
    fn test_deserialize_channel_point_from_string() {
        let cp = format!("{}:1", "cd".repeat(32));
        let resp = listdatastore(json!([{
            "key": funding_key(),
            "generation": 0,
            "string": format!("\"{}\"", cp),
        }]));

        let (value, generation): (ChannelPoint, _) =
            deserialize_by_key(&resp, funding_key()).unwrap();
        assert_eq!(value.to_string(), cp);
        assert_eq!(generation, Some(0));
    }

    #[test]
    fn test_deserialize_falls_back_to_hex() {
        let cp = format!("{}:2", "cd".repeat(32));
        let resp = listdatastore(json!([{
            "key": funding_key(),
            "hex": hex::encode(format!("\"{}\"", cp)),
        }]));

        let (value, _): (ChannelPoint, _) = deserialize_by_key(&resp, funding_key()).unwrap();
        assert_eq!(value.output_index, 2);
    }

    #[test]
    fn test_deserialize_errors() {
        let resp = listdatastore(json!([]));
        assert!(matches!(
            deserialize_by_key::<ChannelPoint, _>(&resp, funding_key()),
            Err(DsError::NotFound { .. })
        ));

        // listdatastore returns children of a prefix too; only exact matches count
        let mut child = funding_key();
        child.push("extra".to_string());
        let resp = listdatastore(json!([{ "key": child, "string": "\"x\"" }]));
        assert!(matches!(
            deserialize_by_key::<ChannelPoint, _>(&resp, funding_key()),
            Err(DsError::NotFound { .. })
        ));

        let resp = listdatastore(json!([{ "key": funding_key() }]));
        assert!(matches!(
            deserialize_by_key::<ChannelPoint, _>(&resp, funding_key()),
            Err(DsError::MissingValue { .. })
        ));

        let resp = listdatastore(json!([{ "key": funding_key(), "string": "not json" }]));
        assert!(matches!(
            deserialize_by_key::<ChannelPoint, _>(&resp, funding_key()),
            Err(DsError::JsonParse { .. })
        ));

        let resp = listdatastore(json!([{ "key": funding_key(), "hex": "zz" }]));
        assert!(matches!(
            deserialize_by_key::<ChannelPoint, _>(&resp, funding_key()),
            Err(DsError::HexDecode { .. })
        ));
    }

    #[test]
    fn test_feerate_for_target() {
        assert!(matches!(feerate_for_target(1), Feerate::Urgent));
        assert!(matches!(feerate_for_target(6), Feerate::Normal));
        assert!(matches!(feerate_for_target(144), Feerate::Slow));
    }
}
