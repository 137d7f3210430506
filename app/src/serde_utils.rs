//! Serde utilities for byte fields and amounts

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserializer, Serializer};
use std::fmt;

struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a hex string or an array of bytes")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        hex::decode(v).map_err(E::custom)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

fn fixed<const N: usize, E: de::Error>(bytes: Vec<u8>) -> Result<[u8; N], E> {
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| E::custom(format!("expected {N} bytes, found {len}")))
}

/// Fixed-size byte arrays as lowercase hex; byte arrays are accepted on input.
pub mod hex_array {
    use super::*;

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        fixed(deserializer.deserialize_any(BytesVisitor)?)
    }
}

pub mod hex_array_opt {
    use super::*;
    use serde::Deserialize;

    pub fn serialize<S, const N: usize>(
        bytes: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => {
                let bytes = value
                    .deserialize_any(BytesVisitor)
                    .map_err(de::Error::custom)?;
                fixed(bytes).map(Some)
            }
        }
    }
}

pub mod hex_array_vec {
    use super::*;
    use serde::ser::SerializeSeq;
    use serde::Deserialize;

    pub fn serialize<S, const N: usize>(items: &[[u8; N]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&hex::encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<Vec<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?;
        values
            .unwrap_or_default()
            .into_iter()
            .map(|value| {
                let bytes = value
                    .deserialize_any(BytesVisitor)
                    .map_err(de::Error::custom)?;
                fixed(bytes)
            })
            .collect()
    }
}

/// Unsigned amounts, accepted either as JSON integers or decimal strings.
pub mod amount {
    use super::*;

    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative integer amount")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(E::custom)
        }
    }

    pub fn serialize<S>(amount: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*amount)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        #[serde(with = "hex_array")]
        key: [u8; 4],
        #[serde(default, with = "hex_array_opt")]
        maybe: Option<[u8; 2]>,
        #[serde(default, with = "hex_array_vec")]
        many: Vec<[u8; 2]>,
        #[serde(with = "amount")]
        value: u64,
    }

    #[test]
    fn accepts_hex_and_byte_arrays() {
        let from_hex: Sample = serde_json::from_str(
            r#"{"key":"01020304","maybe":"0a0b","many":["0001"],"value":"42"}"#,
        )
        .unwrap();
        let from_bytes: Sample = serde_json::from_str(
            r#"{"key":[1,2,3,4],"maybe":[10,11],"many":[[0,1]],"value":42}"#,
        )
        .unwrap();
        assert_eq!(from_hex, from_bytes);

        let json = serde_json::to_value(&from_hex).unwrap();
        assert_eq!(json["key"], "01020304");
        assert_eq!(json["many"][0], "0001");
    }

    #[test]
    fn rejects_wrong_lengths_and_negative_amounts() {
        assert!(serde_json::from_str::<Sample>(r#"{"key":"0102","value":1}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"key":"01020304","value":-1}"#).is_err());
        let missing: Sample = serde_json::from_str(r#"{"key":"01020304","maybe":null,"value":0}"#).unwrap();
        assert_eq!(missing.maybe, None);
        assert!(missing.many.is_empty());
    }
}
