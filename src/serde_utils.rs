use serde::{de::Error, Deserialize, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

pub fn from_hex<'de, D, E>(deserializer: D) -> Result<E, D::Error>
where
    D: Deserializer<'de>,
    E: TryFrom<Vec<u8>>,
    E::Error: core::fmt::Debug,
{
    String::deserialize(deserializer)
        .and_then(|string| {
            if string.len() < 2 || &string[..2].to_lowercase() != "0x" {
                return Err(Error::custom(format!(
                    "hex string does not start with 0x: {}",
                    &string
                )));
            };
            hex::decode(&string[2..]).map_err(|err| {
                Error::custom(format!(
                    "failed to decode hex string {}: {:?}",
                    &string, err
                ))
            })
        })
        .and_then(|vec| {
            vec.try_into().map_err(|err| {
                Error::custom(format!("failed to convert vector into type: {:?}", err))
            })
        })
}

pub fn to_hex<E, S>(e: E, serializer: S) -> Result<S::Ok, S::Error>
where
    E: AsRef<[u8]>,
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", &hex::encode(e.as_ref())))
}

pub struct SliceHex;

impl<T> SerializeAs<T> for SliceHex
where
    T: AsRef<[u8]>,
{
    fn serialize_as<S>(source: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_hex(source, serializer)
    }
}

impl<'de, T> DeserializeAs<'de, T> for SliceHex
where
    T: TryFrom<Vec<u8>>,
    T::Error: core::fmt::Debug,
{
    fn deserialize_as<D>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
    {
        from_hex(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_with::serde_as;

    #[serde_as]
    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Foo {
        #[serde_as(as = "SliceHex")]
        bar: Vec<u8>,
    }

    #[test]
    fn test_slice_hex_roundtrip() {
        let foo = Foo {
            bar: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = bincode::serialize(&foo).expect("serialize");
        let decoded: Foo = bincode::deserialize(&encoded).expect("deserialize");
        assert_eq!(foo, decoded);
    }

    #[test]
    fn test_slice_hex_rejects_missing_prefix() {
        // The adapter writes a 0x-prefixed string; a bare hex string must
        // not deserialize.
        let encoded = bincode::serialize(&"deadbeef".to_string()).expect("serialize");
        assert!(bincode::deserialize::<Foo>(&encoded).is_err());
    }
}
