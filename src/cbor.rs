//! CBOR wire format for reward protocol packets.
//!
//! Every exchange carries a single [`Packet`], encoded as a deterministic
//! CBOR map keyed by integer field numbers so the format stays
//! self-describing and forward-compatible. Group elements travel as their
//! canonical compressed byte encodings.

use ciborium::value::Value;

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective};

use crate::{G1_LEN, G2_LEN};

/// Operation id: blind-sign step (`h` in, `psi` out).
pub const PID_BLIND_SIGN: u32 = 1;
/// Operation id: single receipt verification.
pub const PID_VERIFY: u32 = 2;
/// Operation id: aggregate verification.
pub const PID_AGGREGATE_VERIFY: u32 = 3;
/// Operation id: fetch the issuer public key.
pub const PID_FETCH_PUBLIC_KEY: u32 = 101;
/// Operation id: fetch the G1 generator.
pub const PID_FETCH_G1: u32 = 102;
/// Operation id: fetch the G2 generator.
pub const PID_FETCH_G2: u32 = 103;
/// Operation id reserved for responses refused by the authorization hook.
pub const PID_REFUSED: u32 = 999;

/// Error type for packet and element (de)serialization
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    /// Error from ciborium library
    #[error("cbor decode: {0}")]
    Ciborium(#[from] ciborium::de::Error<std::io::Error>),
    /// Invalid CBOR structure
    #[error("invalid packet structure: {0}")]
    InvalidStructure(&'static str),
    /// Invalid field value
    #[error("invalid field value: {0}")]
    InvalidValue(&'static str),
}

impl From<ciborium::ser::Error<std::io::Error>> for CborError {
    fn from(_: ciborium::ser::Error<std::io::Error>) -> Self {
        CborError::InvalidStructure("serialization error")
    }
}

/// The wire packet: an operation id plus the subset of fields that
/// operation uses. Which fields are populated for which pid is fixed by the
/// dispatch table in [`crate::net`].
///
/// ```text
/// RewardPacketMsg = {
///     1: uint,             ; pid (operation id)
///     ? 2: bstr,           ; element1
///     ? 3: bstr,           ; element2
///     ? 4: bstr,           ; element3
///     ? 5: [* bstr / nil], ; elementList1 (nil entries decode to None)
///     ? 6: [* bstr / nil], ; elementList2
///     ? 7: bool,           ; isValid
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub pid: u32,
    pub e1: Option<Vec<u8>>,
    pub e2: Option<Vec<u8>>,
    pub e3: Option<Vec<u8>>,
    pub e_list1: Option<Vec<Option<Vec<u8>>>>,
    pub e_list2: Option<Vec<Option<Vec<u8>>>>,
    pub is_valid: Option<bool>,
}

impl Packet {
    /// The payload-free response sent when the authorization hook refuses a
    /// request.
    pub fn refused() -> Self {
        Packet {
            pid: PID_REFUSED,
            ..Packet::default()
        }
    }

    /// Encode to a CBOR map, omitting absent fields.
    pub fn to_cbor(&self) -> Result<Vec<u8>, CborError> {
        let mut map = Vec::new();
        map.push((Value::Integer(1.into()), Value::Integer(self.pid.into())));
        if let Some(e1) = &self.e1 {
            map.push((Value::Integer(2.into()), Value::Bytes(e1.clone())));
        }
        if let Some(e2) = &self.e2 {
            map.push((Value::Integer(3.into()), Value::Bytes(e2.clone())));
        }
        if let Some(e3) = &self.e3 {
            map.push((Value::Integer(4.into()), Value::Bytes(e3.clone())));
        }
        if let Some(list) = &self.e_list1 {
            map.push((Value::Integer(5.into()), encode_list(list)));
        }
        if let Some(list) = &self.e_list2 {
            map.push((Value::Integer(6.into()), encode_list(list)));
        }
        if let Some(valid) = self.is_valid {
            map.push((Value::Integer(7.into()), Value::Bool(valid)));
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(&Value::Map(map), &mut bytes)?;
        Ok(bytes)
    }

    /// Decode from CBOR
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CborError> {
        let value: Value = ciborium::from_reader(bytes)?;

        match value {
            Value::Map(map) => {
                let mut pid = None;
                let mut packet = Packet::default();

                for (k, v) in map {
                    match k {
                        Value::Integer(i) if i == 1.into() => pid = Some(decode_pid(&v)?),
                        Value::Integer(i) if i == 2.into() => packet.e1 = Some(decode_bytes(v)?),
                        Value::Integer(i) if i == 3.into() => packet.e2 = Some(decode_bytes(v)?),
                        Value::Integer(i) if i == 4.into() => packet.e3 = Some(decode_bytes(v)?),
                        Value::Integer(i) if i == 5.into() => {
                            packet.e_list1 = Some(decode_list(v)?)
                        }
                        Value::Integer(i) if i == 6.into() => {
                            packet.e_list2 = Some(decode_list(v)?)
                        }
                        Value::Integer(i) if i == 7.into() => {
                            packet.is_valid = Some(decode_bool(&v)?)
                        }
                        _ => {}
                    }
                }

                packet.pid = pid.ok_or(CborError::InvalidStructure("missing field 1 (pid)"))?;
                Ok(packet)
            }
            _ => Err(CborError::InvalidStructure("expected CBOR map")),
        }
    }
}

fn encode_list(entries: &[Option<Vec<u8>>]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|entry| match entry {
                Some(bytes) => Value::Bytes(bytes.clone()),
                None => Value::Null,
            })
            .collect(),
    )
}

fn decode_list(value: Value) -> Result<Vec<Option<Vec<u8>>>, CborError> {
    match value {
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::Bytes(bytes) => Ok(Some(bytes)),
                Value::Null => Ok(None),
                _ => Err(CborError::InvalidStructure(
                    "expected byte string or null in element list",
                )),
            })
            .collect(),
        _ => Err(CborError::InvalidStructure("expected array for element list")),
    }
}

fn decode_pid(value: &Value) -> Result<u32, CborError> {
    match value {
        Value::Integer(i) => {
            u32::try_from(i128::from(*i)).map_err(|_| CborError::InvalidValue("pid out of range"))
        }
        _ => Err(CborError::InvalidStructure("expected integer for pid")),
    }
}

fn decode_bytes(value: Value) -> Result<Vec<u8>, CborError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err(CborError::InvalidStructure("expected byte string for element")),
    }
}

fn decode_bool(value: &Value) -> Result<bool, CborError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(CborError::InvalidStructure("expected bool for isValid")),
    }
}

/// Encode a G1 element as its 48-byte compressed form
pub fn encode_g1(p: &G1Projective) -> Vec<u8> {
    G1Affine::from(p).to_compressed().to_vec()
}

/// Decode a G1 element from its compressed bytes
pub fn decode_g1(bytes: &[u8]) -> Result<G1Projective, CborError> {
    let arr: [u8; G1_LEN] = bytes
        .try_into()
        .map_err(|_| CborError::InvalidValue("expected 48-byte compressed G1 element"))?;
    Option::<G1Affine>::from(G1Affine::from_compressed(&arr))
        .map(G1Projective::from)
        .ok_or(CborError::InvalidValue("invalid G1 element"))
}

/// Encode a G2 element as its 96-byte compressed form
pub fn encode_g2(p: &G2Projective) -> Vec<u8> {
    G2Affine::from(p).to_compressed().to_vec()
}

/// Decode a G2 element from its compressed bytes
pub fn decode_g2(bytes: &[u8]) -> Result<G2Projective, CborError> {
    let arr: [u8; G2_LEN] = bytes
        .try_into()
        .map_err(|_| CborError::InvalidValue("expected 96-byte compressed G2 element"))?;
    Option::<G2Affine>::from(G2Affine::from_compressed(&arr))
        .map(G2Projective::from)
        .ok_or(CborError::InvalidValue("invalid G2 element"))
}
