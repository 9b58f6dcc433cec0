use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Upstream-assigned identifiers. Opaque: the gateway never parses them.
opaque_id!(ChatId);
opaque_id!(CharacterId);
opaque_id!(MessageId);

// Downstream subscriber identifier; generated when the client omits one.
opaque_id!(ClientId);

impl ClientId {
    pub fn generate() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_id_has_prefix() {
        let id = ClientId::generate();
        assert!(id.as_str().starts_with("client_"), "got: {id}");
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = CharacterId::from_raw("char-123");
        assert_eq!(id.as_str(), "char-123");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = MessageId::from_raw("msg-1");
        let s = id.to_string();
        let parsed: MessageId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ChatId::from_raw("chat-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"chat-7\"");
        let parsed: ChatId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
