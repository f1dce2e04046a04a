use crate::error::ChannelLayerError;
use crate::message::Message;
use rmpv::Value;

/// Serializes a [`Message`] to a compact, self-describing binary payload.
///
/// Grounded on the original's choice of MessagePack with `use_bin_type=True`
/// (`asgi_rabbitmq/core.py` lines 333-336): `rmpv::Value` keeps the same
/// binary/text distinction on the wire, so a `Vec<u8>` value round-trips as
/// binary and a `String` value round-trips as text, with no schema imposed
/// by this crate.
pub fn encode(message: &Message) -> Vec<u8> {
    let entries = message
        .iter()
        .map(|(k, v)| (Value::String(k.clone().into()), v.clone()))
        .collect();
    let value = Value::Map(entries);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encoding into a Vec<u8> cannot fail");
    buf
}

/// Deserializes a payload produced by [`encode`] back into a [`Message`].
pub fn decode(bytes: &[u8]) -> Result<Message, ChannelLayerError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ChannelLayerError::Codec(e.to_string()))?;

    let Value::Map(entries) = value else {
        return Err(ChannelLayerError::Codec(
            "top-level msgpack value is not a map".to_string(),
        ));
    };

    let mut message = Message::new();
    for (k, v) in entries {
        let key = match k {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| ChannelLayerError::Codec("map key is not valid UTF-8".to_string()))?,
            other => return Err(ChannelLayerError::Codec(format!(
                "map key is not a string: {:?}",
                other
            ))),
        };
        message.insert(key, v);
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{binary, integer, text};

    #[test]
    fn round_trips_text_and_binary_distinctly() {
        let mut message = Message::new();
        message.insert("text".to_string(), text("hi"));
        message.insert("bin".to_string(), binary(vec![0u8, 1, 2, 255]));
        message.insert("n".to_string(), integer(42));

        let encoded = encode(&message);
        let decoded = decode(&encoded).expect("decode");

        assert_eq!(decoded.get("text"), Some(&Value::String("hi".into())));
        assert_eq!(
            decoded.get("bin"),
            Some(&Value::Binary(vec![0u8, 1, 2, 255]))
        );
        assert_eq!(decoded.get("n"), Some(&Value::Integer(42.into())));
    }

    #[test]
    fn empty_message_round_trips() {
        let message = Message::new();
        let encoded = encode(&message);
        let decoded = decode(&encoded).expect("decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn rejects_non_map_payload() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Integer(1.into())).unwrap();
        assert!(decode(&buf).is_err());
    }
}
