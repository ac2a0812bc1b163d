use hub_types::HubError;

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, HubError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| HubError::Codec(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, HubError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| HubError::Codec(e.to_string()))
}
