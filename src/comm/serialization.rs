//! Byte-level encode/decode for everything that crosses the wire or hits
//! disk. Kept in one place so the wire format can change without touching
//! call sites.

/// Serializes data to a byte array.
pub fn serialize<S>(value: &S) -> Vec<u8>
where
    S: serde::Serialize,
{
    bincode::serialize(value).expect("bincode serialization")
}

/// Serializes data into a writer.
pub fn serialize_into<W, S>(writer: W, value: &S)
where
    W: std::io::Write,
    S: serde::Serialize,
{
    bincode::serialize_into(writer, value).expect("bincode serialization");
}

/// Deserializes data from a byte array.
pub fn deserialize<D>(data: &[u8]) -> D
where
    D: serde::de::DeserializeOwned,
{
    bincode::deserialize(data).expect("bincode deserialization")
}

/// Deserializes data from a reader.
pub fn deserialize_from<R, D>(reader: R) -> D
where
    R: std::io::Read,
    D: serde::de::DeserializeOwned,
{
    bincode::deserialize_from(reader).expect("bincode deserialization")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_empty_vec_is_nonempty() {
        // Receivers discriminate between "no payload yet" and a provided
        // empty value by buffer length; this relies on bincode encoding the
        // length prefix even for empty sequences.
        let empty = Vec::<u64>::new();
        assert!(!serialize(&empty).is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let value = (vec![1usize, 5, 9], -2.5f64);
        let bytes = serialize(&value);
        let back: (Vec<usize>, f64) = deserialize(&bytes);
        assert_eq!(back, value);
    }
}
