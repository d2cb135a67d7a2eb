//! Decoder registry: maps data tags to typed decoders.
//!
//! Incoming records carry a `(package, name)` tag; the registry resolves it
//! to a decode function registered at startup, so payload decoding never
//! depends on runtime reflection. Unregistered tags are permanent decode
//! failures for that record.

use super::DataTag;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("No decoder registered for tag {0}")]
    UnknownTag(String),
    #[error("Payload for tag {tag} failed to decode: {detail}")]
    Malformed { tag: String, detail: String },
}

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, DecodeError> + Send + Sync>;

/// Registry of payload decoders keyed by [`DataTag`].
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: RwLock<HashMap<DataTag, DecodeFn>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed decoder for a tag. Later registrations replace
    /// earlier ones.
    pub fn register<T>(&self, tag: DataTag)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let decode_tag = tag.clone();
        let decode: DecodeFn = Arc::new(move |bytes| {
            bincode::deserialize::<T>(bytes)
                .map(|value| Box::new(value) as Box<dyn Any + Send>)
                .map_err(|e| DecodeError::Malformed {
                    tag: decode_tag.to_string(),
                    detail: e.to_string(),
                })
        });
        self.decoders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag, decode);
    }

    /// Decode a payload by tag. Downcast the result with
    /// `result.downcast::<T>()`.
    pub fn decode(&self, tag: &DataTag, bytes: &[u8]) -> Result<Box<dyn Any + Send>, DecodeError> {
        let decode = self
            .decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
            .ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;
        decode(bytes)
    }

    pub fn is_registered(&self, tag: &DataTag) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Offer {
        market: String,
        amount: u64,
    }

    fn offer_tag() -> DataTag {
        DataTag::new("exchange", "Offer")
    }

    #[test]
    fn test_registered_tag_decodes() {
        let registry = DecoderRegistry::new();
        registry.register::<Offer>(offer_tag());

        let offer = Offer {
            market: "BTC/EUR".into(),
            amount: 21,
        };
        let bytes = bincode::serialize(&offer).unwrap();

        let decoded = registry.decode(&offer_tag(), &bytes).unwrap();
        let decoded = decoded.downcast::<Offer>().unwrap();
        assert_eq!(*decoded, offer);
    }

    #[test]
    fn test_unknown_tag_is_permanent_failure() {
        let registry = DecoderRegistry::new();
        let result = registry.decode(&offer_tag(), &[1, 2, 3]);
        assert!(matches!(result, Err(DecodeError::UnknownTag(_))));
        assert!(!registry.is_registered(&offer_tag()));
    }

    #[test]
    fn test_malformed_payload_fails() {
        let registry = DecoderRegistry::new();
        registry.register::<Offer>(offer_tag());

        let result = registry.decode(&offer_tag(), &[0xFF]);
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = DecoderRegistry::new();
        registry.register::<Offer>(offer_tag());
        registry.register::<u64>(offer_tag());

        let bytes = bincode::serialize(&7u64).unwrap();
        let decoded = registry.decode(&offer_tag(), &bytes).unwrap();
        assert_eq!(*decoded.downcast::<u64>().unwrap(), 7);
    }
}
