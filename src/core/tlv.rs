//! BOLT TLV streams.
//!
//! Types and lengths are `BigSize` encoded (big-endian, `0xfd`/`0xfe`/`0xff`
//! prefixed), integer values use the truncated `tu64`/`tu32` forms with
//! leading zero bytes stripped.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, BytesMut};

pub type BigSize = u64;

/// A variant of BigSize that works on length-delimited buffers and therefore
/// does not require a length prefix.
pub type TU64 = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub typ: u64,
    pub value: Vec<u8>,
}

/// An ordered set of TLV records with strictly increasing types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream(pub Vec<TlvEntry>);

impl TlvStream {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn get(&self, typ: u64) -> Option<&TlvEntry> {
        self.0.iter().find(|e| e.typ == typ)
    }

    pub fn set_bytes<T>(&mut self, typ: u64, val: T)
    where
        T: AsRef<[u8]>,
    {
        let value = val.as_ref().to_vec();
        match self.0.binary_search_by_key(&typ, |e| e.typ) {
            Ok(i) => self.0[i].value = value,
            Err(i) => self.0.insert(i, TlvEntry { typ, value }),
        }
    }

    pub fn set_tu64(&mut self, typ: u64, val: TU64) {
        let mut b = BytesMut::new();
        b.put_tu64(val);
        self.set_bytes(typ, b)
    }

    pub fn get_tu64(&self, typ: u64) -> Result<Option<TU64>> {
        match self.get(typ) {
            Some(e) => decode_tu64(&e.value).map(Some),
            None => Ok(None),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = BytesMut::new();
        for e in self.0.iter() {
            b.put_big_size(e.typ);
            b.put_big_size(e.value.len() as u64);
            b.put(&e.value[..]);
        }
        b.to_vec()
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let mut b = raw;
        let mut stream = TlvStream::new();
        let mut last_typ: Option<u64> = None;
        while b.has_remaining() {
            let typ = b.get_big_size()?;
            if last_typ.is_some_and(|last| typ <= last) {
                bail!("TLV types out of order: {} after {:?}", typ, last_typ);
            }
            let len = b.get_big_size()? as usize;
            if b.remaining() < len {
                bail!(
                    "TLV record type={} claims {} bytes, only {} remaining",
                    typ,
                    len,
                    b.remaining()
                );
            }
            let value = b.copy_to_bytes(len).to_vec();
            stream.0.push(TlvEntry { typ, value });
            last_typ = Some(typ);
        }
        Ok(stream)
    }
}

/// Decodes a truncated integer, rejecting non-minimal encodings.
pub fn decode_tu64(value: &[u8]) -> Result<TU64> {
    if value.len() > 8 {
        bail!("tu64 value too long: {} bytes", value.len());
    }
    if value.first() == Some(&0) {
        bail!("tu64 value is not minimally encoded");
    }
    Ok(value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Extensions on top of `Buf` to include LN proto primitives
pub trait ProtoBuf: Buf {
    fn get_big_size(&mut self) -> Result<BigSize> {
        if !self.has_remaining() {
            return Err(anyhow!("unexpected end of buffer reading BigSize"));
        }
        let (value, min) = match self.get_u8() {
            253 => {
                ensure_remaining(self, 2)?;
                (self.get_u16() as u64, 0xFD)
            }
            254 => {
                ensure_remaining(self, 4)?;
                (self.get_u32() as u64, 0x10000)
            }
            255 => {
                ensure_remaining(self, 8)?;
                (self.get_u64(), 0x100000000)
            }
            v => return Ok(v as u64),
        };
        if value < min {
            bail!("BigSize {} is not canonically encoded", value);
        }
        Ok(value)
    }
}

fn ensure_remaining<B: Buf + ?Sized>(b: &B, n: usize) -> Result<()> {
    if b.remaining() < n {
        bail!("unexpected end of buffer: need {} bytes, have {}", n, b.remaining());
    }
    Ok(())
}

impl ProtoBuf for &[u8] {}

pub trait ProtoBufMut: BufMut {
    fn put_big_size(&mut self, cs: BigSize) {
        match cs {
            0..=0xFC => self.put_u8(cs as u8),
            0xFD..=0xFFFF => {
                self.put_u8(253);
                self.put_u16(cs as u16);
            }
            0x10000..=0xFFFFFFFF => {
                self.put_u8(254);
                self.put_u32(cs as u32);
            }
            v => {
                self.put_u8(255);
                self.put_u64(v);
            }
        }
    }

    fn put_tu64(&mut self, u: TU64) {
        let b = u.to_be_bytes();
        let skip = b.iter().take_while(|&&x| x == 0).count();
        self.put_slice(&b[skip..]);
    }
}

impl ProtoBufMut for BytesMut {}
impl ProtoBufMut for Vec<u8> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_size_encoding_boundaries() {
        let cases: [(u64, &str); 5] = [
            (0, "00"),
            (0xFC, "fc"),
            (0xFD, "fd00fd"),
            (0x10000, "fe00010000"),
            (0x100000000, "ff0000000100000000"),
        ];
        for (value, expected) in cases {
            let mut b = Vec::new();
            b.put_big_size(value);
            assert_eq!(hex::encode(&b), expected);
            let mut slice = &b[..];
            assert_eq!(slice.get_big_size().unwrap(), value);
        }
    }

    #[test]
    fn test_big_size_rejects_non_canonical() {
        let raw = hex::decode("fd00fc").unwrap();
        assert!((&raw[..]).get_big_size().is_err());
        let raw = hex::decode("fd00").unwrap();
        assert!((&raw[..]).get_big_size().is_err());
    }

    #[test]
    fn test_tu64_strips_leading_zeros() {
        let mut b = Vec::new();
        b.put_tu64(0);
        assert!(b.is_empty());

        let mut b = Vec::new();
        b.put_tu64(0x0102);
        assert_eq!(b, vec![0x01, 0x02]);
        assert_eq!(decode_tu64(&b).unwrap(), 0x0102);
        assert_eq!(decode_tu64(&[]).unwrap(), 0);
        assert!(decode_tu64(&[0x00, 0x01]).is_err());
        assert!(decode_tu64(&[1u8; 9]).is_err());
    }

    #[test]
    fn test_stream_keeps_types_ordered() {
        let mut stream = TlvStream::new();
        stream.set_tu64(8, 1);
        stream.set_tu64(2, 1000);
        stream.set_tu64(4, 800_000);
        let types: Vec<u64> = stream.0.iter().map(|e| e.typ).collect();
        assert_eq!(types, vec![2, 4, 8]);

        // setting an existing type replaces its value
        stream.set_tu64(4, 1);
        assert_eq!(stream.0.len(), 3);
        assert_eq!(stream.get_tu64(4).unwrap(), Some(1));
    }

    #[test]
    fn test_stream_parse() {
        // amt_to_forward=1000, outgoing_cltv_value=800000
        let raw = hex::decode("020203e804030c3500").unwrap();
        let stream = TlvStream::from_bytes(&raw).unwrap();
        assert_eq!(stream.0.len(), 2);
        assert_eq!(stream.get_tu64(2).unwrap(), Some(1000));
        assert_eq!(stream.get_tu64(4).unwrap(), Some(800_000));
        assert_eq!(stream.get_tu64(6).unwrap(), None);
        assert_eq!(stream.to_bytes(), raw);
    }

    #[test]
    fn test_stream_parse_errors() {
        // length exceeds buffer
        assert!(TlvStream::from_bytes(&hex::decode("0205e8").unwrap()).is_err());
        // types must increase
        assert!(TlvStream::from_bytes(&hex::decode("040101020101").unwrap()).is_err());
    }
}
