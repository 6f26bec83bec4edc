//! Single-hop Sphinx packets (BOLT 4).
//!
//! When a payment is rerouted through a freshly opened channel the original
//! onion no longer matches the route, so we wrap a new final-hop payload for
//! the destination. Only one hop is ever built, which keeps the filler empty.

use std::sync::Arc;

use bitcoin::hashes::{
    hmac::{Hmac, HmacEngine},
    sha256, Hash, HashEngine,
};
use bitcoin::secp256k1::{ecdh::SharedSecret, All, PublicKey, Secp256k1, SecretKey};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::provider::SessionKeySource;
use crate::core::tlv::{decode_tu64, ProtoBuf, ProtoBufMut, TlvStream};
use crate::proto::primitives::{Msat, PaymentHash};

pub const ONION_VERSION: u8 = 0;
pub const ROUTING_INFO_SIZE: usize = 1300;
pub const HMAC_SIZE: usize = 32;
pub const ONION_PACKET_SIZE: usize = 1 + 33 + ROUTING_INFO_SIZE + HMAC_SIZE;

const TLV_AMT_TO_FORWARD: u64 = 2;
const TLV_OUTGOING_CLTV_VALUE: u64 = 4;
const TLV_PAYMENT_DATA: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    #[error("failed to obtain session key: {0}")]
    SessionKey(#[source] anyhow::Error),
    #[error("hop payload of {size} bytes exceeds {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("onion packet must be 1366 bytes, got {0}")]
    InvalidLength(usize),
    #[error("unknown onion version {0}")]
    UnknownVersion(u8),
    #[error("invalid ephemeral key: {0}")]
    InvalidEphemeralKey(#[from] bitcoin::secp256k1::Error),
    #[error("onion hmac mismatch")]
    HmacMismatch,
    #[error("malformed hop payload: {0}")]
    MalformedPayload(#[source] anyhow::Error),
}

/// `payment_data` record, binds the part to its multi-part payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MppRecord {
    pub payment_addr: [u8; 32],
    pub total_msat: Msat,
}

/// Final-hop payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopPayload {
    pub amt_to_forward: Msat,
    pub outgoing_cltv_value: u32,
    pub mpp: Option<MppRecord>,
}

impl HopPayload {
    pub fn to_tlv(&self) -> TlvStream {
        let mut stream = TlvStream::new();
        stream.set_tu64(TLV_AMT_TO_FORWARD, self.amt_to_forward.msat());
        stream.set_tu64(TLV_OUTGOING_CLTV_VALUE, self.outgoing_cltv_value as u64);
        if let Some(mpp) = &self.mpp {
            let mut value = mpp.payment_addr.to_vec();
            value.put_tu64(mpp.total_msat.msat());
            stream.set_bytes(TLV_PAYMENT_DATA, value);
        }
        stream
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_tlv().to_bytes()
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        let stream = TlvStream::from_bytes(raw)?;
        let amt_to_forward = stream
            .get_tu64(TLV_AMT_TO_FORWARD)?
            .ok_or_else(|| anyhow::anyhow!("missing amt_to_forward"))?;
        let outgoing_cltv_value = stream
            .get_tu64(TLV_OUTGOING_CLTV_VALUE)?
            .ok_or_else(|| anyhow::anyhow!("missing outgoing_cltv_value"))?;
        let outgoing_cltv_value = u32::try_from(outgoing_cltv_value)
            .map_err(|_| anyhow::anyhow!("outgoing_cltv_value {} overflows tu32", outgoing_cltv_value))?;

        let mpp = match stream.get(TLV_PAYMENT_DATA) {
            Some(e) => {
                if e.value.len() < 32 {
                    anyhow::bail!("payment_data too short: {} bytes", e.value.len());
                }
                let (addr, total) = e.value.split_at(32);
                let mut payment_addr = [0u8; 32];
                payment_addr.copy_from_slice(addr);
                Some(MppRecord {
                    payment_addr,
                    total_msat: Msat(decode_tu64(total)?),
                })
            }
            None => None,
        };

        Ok(Self {
            amt_to_forward: Msat(amt_to_forward),
            outgoing_cltv_value,
            mpp,
        })
    }
}

/// A freshly built packet. Never reused across HTLCs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionForwardPacket {
    pub session_pubkey: PublicKey,
    /// Serialized TLV hop payload, without the length prefix
    pub hop_payload: Vec<u8>,
    /// `version ‖ ephemeral key ‖ routing info ‖ hmac`
    pub blob: Vec<u8>,
}

/// Rebuilds the forwarding onion for a rerouted HTLC.
#[derive(Clone)]
pub struct OnionRepacker {
    secp: Secp256k1<All>,
    key_source: Arc<dyn SessionKeySource>,
}

impl OnionRepacker {
    pub fn new(key_source: Arc<dyn SessionKeySource>) -> Self {
        Self {
            secp: Secp256k1::new(),
            key_source,
        }
    }

    pub fn build(
        &self,
        destination: &PublicKey,
        forward_msat: Msat,
        total_msat: Msat,
        expiry: u32,
        mpp_address: &[u8; 32],
        payment_hash: &PaymentHash,
    ) -> Result<OnionForwardPacket, OnionError> {
        let payload = HopPayload {
            amt_to_forward: forward_msat,
            outgoing_cltv_value: expiry,
            mpp: Some(MppRecord {
                payment_addr: *mpp_address,
                total_msat,
            }),
        };
        let session_key = self
            .key_source
            .session_key()
            .map_err(OnionError::SessionKey)?;
        self.wrap(destination, &session_key, &payload, payment_hash)
    }

    pub fn wrap(
        &self,
        destination: &PublicKey,
        session_key: &SecretKey,
        payload: &HopPayload,
        payment_hash: &PaymentHash,
    ) -> Result<OnionForwardPacket, OnionError> {
        let hop_payload = payload.encode();

        let mut hop_data = Vec::with_capacity(hop_payload.len() + 3 + HMAC_SIZE);
        hop_data.put_big_size(hop_payload.len() as u64);
        hop_data.extend_from_slice(&hop_payload);
        // last hop, no next hmac
        hop_data.extend_from_slice(&[0u8; HMAC_SIZE]);
        if hop_data.len() > ROUTING_INFO_SIZE {
            return Err(OnionError::PayloadTooLarge {
                size: hop_payload.len(),
                max: ROUTING_INFO_SIZE - HMAC_SIZE - 3,
            });
        }

        let session_pubkey = PublicKey::from_secret_key(&self.secp, session_key);
        let ss = SharedSecret::new(destination, session_key).secret_bytes();
        let rho = generate_key(b"rho", &ss);
        let mu = generate_key(b"mu", &ss);

        let mut routing_info = [0u8; ROUTING_INFO_SIZE];
        let pad_key = generate_key(b"pad", &session_key.secret_bytes());
        apply_stream(&pad_key, &mut routing_info);

        routing_info.copy_within(0..ROUTING_INFO_SIZE - hop_data.len(), hop_data.len());
        routing_info[..hop_data.len()].copy_from_slice(&hop_data);
        apply_stream(&rho, &mut routing_info);

        let hmac = calc_mac(&mu, &routing_info, payment_hash.as_bytes());

        let mut blob = Vec::with_capacity(ONION_PACKET_SIZE);
        blob.push(ONION_VERSION);
        blob.extend_from_slice(&session_pubkey.serialize());
        blob.extend_from_slice(&routing_info);
        blob.extend_from_slice(&hmac);

        Ok(OnionForwardPacket {
            session_pubkey,
            hop_payload,
            blob,
        })
    }
}

/// Result of peeling our layer off a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeledHop {
    pub payload: HopPayload,
    pub next_hmac: [u8; HMAC_SIZE],
}

impl PeeledHop {
    pub fn is_final(&self) -> bool {
        self.next_hmac == [0u8; HMAC_SIZE]
    }
}

/// Decrypts the outermost layer of `blob` with `node_secret`.
pub fn peel(
    node_secret: &SecretKey,
    blob: &[u8],
    payment_hash: &PaymentHash,
) -> Result<PeeledHop, OnionError> {
    if blob.len() != ONION_PACKET_SIZE {
        return Err(OnionError::InvalidLength(blob.len()));
    }
    if blob[0] != ONION_VERSION {
        return Err(OnionError::UnknownVersion(blob[0]));
    }
    let ephemeral_key = PublicKey::from_slice(&blob[1..34])?;
    let routing_info = &blob[34..34 + ROUTING_INFO_SIZE];
    let packet_hmac = &blob[34 + ROUTING_INFO_SIZE..];

    let ss = SharedSecret::new(&ephemeral_key, node_secret).secret_bytes();
    let mu = generate_key(b"mu", &ss);
    if calc_mac(&mu, routing_info, payment_hash.as_bytes()) != packet_hmac {
        return Err(OnionError::HmacMismatch);
    }

    let rho = generate_key(b"rho", &ss);
    let mut plain = vec![0u8; 2 * ROUTING_INFO_SIZE];
    plain[..ROUTING_INFO_SIZE].copy_from_slice(routing_info);
    apply_stream(&rho, &mut plain);

    let mut b = &plain[..];
    let len = b
        .get_big_size()
        .map_err(OnionError::MalformedPayload)? as usize;
    if len + HMAC_SIZE > b.len() {
        return Err(OnionError::MalformedPayload(anyhow::anyhow!(
            "hop payload length {} exceeds packet",
            len
        )));
    }
    let payload = HopPayload::decode(&b[..len]).map_err(OnionError::MalformedPayload)?;
    let mut next_hmac = [0u8; HMAC_SIZE];
    next_hmac.copy_from_slice(&b[len..len + HMAC_SIZE]);

    Ok(PeeledHop { payload, next_hmac })
}

fn generate_key(key_type: &[u8], secret: &[u8; 32]) -> [u8; 32] {
    let mut engine = HmacEngine::<sha256::Hash>::new(key_type);
    engine.input(secret);
    Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
}

fn calc_mac(key: &[u8; 32], routing_info: &[u8], assoc_data: &[u8]) -> [u8; 32] {
    let mut engine = HmacEngine::<sha256::Hash>::new(key);
    engine.input(routing_info);
    engine.input(assoc_data);
    Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
}

/// XORs `buf` with the ChaCha20 keystream for `key` (zero nonce, counter 0).
fn apply_stream(key: &[u8; 32], buf: &mut [u8]) {
    let mut stream = vec![0u8; buf.len()];
    ChaCha20Rng::from_seed(*key).fill_bytes(&mut stream);
    buf.iter_mut().zip(stream).for_each(|(b, k)| *b ^= k);
}
