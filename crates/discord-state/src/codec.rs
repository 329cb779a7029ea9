//! Encoding of entity snapshots into RedisJSON documents.
//!
//! ## Document format
//!
//! Entities are stored at the root path `$`. A root `JSON.GET` replies with a JSON
//! array holding the matched values:
//!
//! | Reply | Meaning |
//! |-------|---------|
//! | nil | key does not exist (miss) |
//! | `[null]` | negative entry: the entity is confirmed absent |
//! | `[{...}]` | entity document |
//! | `[]` | path did not match (treated as a miss) |

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StateError;

/// Root JSON path.
pub const ROOT: &str = "$";

/// Document written for a confirmed-absent entity.
pub const NEGATIVE_MARKER: &str = "null";

/// A decoded cache document.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Present(T),
    Absent,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cached document is not a JSON path reply: {0}")]
    Envelope(serde_json::Error),

    #[error("cached document does not match the entity shape: {0}")]
    Shape(serde_json::Error),

    #[error("failed to encode entity: {0}")]
    Encode(serde_json::Error),
}

impl From<CodecError> for StateError {
    fn from(e: CodecError) -> Self {
        StateError::Codec(e.to_string())
    }
}

/// Encode an entity as a JSON document for `JSON.SET`.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(CodecError::Encode)
}

/// Decode a root-path `JSON.GET` reply.
///
/// Returns `Ok(None)` when the reply holds no value (an empty match), which callers
/// treat like a missing key.
pub fn decode_root<T: DeserializeOwned>(raw: &str) -> Result<Option<Cached<T>>, CodecError> {
    let mut matches: Vec<Value> = serde_json::from_str(raw).map_err(CodecError::Envelope)?;
    if matches.is_empty() {
        return Ok(None);
    }

    match matches.swap_remove(0) {
        Value::Null => Ok(Some(Cached::Absent)),
        value => serde_json::from_value(value)
            .map(|v| Some(Cached::Present(v)))
            .map_err(CodecError::Shape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, User};

    #[test]
    fn decodes_present_document() {
        let raw = r#"[{"id":"555","username":"alice"}]"#;
        let decoded = decode_root::<User>(raw).unwrap();
        match decoded {
            Some(Cached::Present(user)) => assert_eq!(user.username, "alice"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_negative_marker() {
        assert_eq!(decode_root::<User>("[null]").unwrap(), Some(Cached::Absent));
    }

    #[test]
    fn empty_match_is_a_miss() {
        assert_eq!(decode_root::<User>("[]").unwrap(), None);
    }

    #[test]
    fn wrong_shape_is_an_error() {
        assert!(matches!(
            decode_root::<User>(r#"[{"bogus":true}]"#),
            Err(CodecError::Shape(_))
        ));
        assert!(matches!(
            decode_root::<User>("not json"),
            Err(CodecError::Envelope(_))
        ));
    }

    #[test]
    fn role_lists_are_stored_as_arrays() {
        let roles = vec![Role {
            id: "999".into(),
            name: "Regular".into(),
            color: 0x00ff00,
            position: 3,
            permissions: "0".into(),
            hoist: false,
            managed: false,
            mentionable: true,
            extra: Default::default(),
        }];
        let doc = encode(&roles).unwrap();
        let decoded = decode_root::<Vec<Role>>(&format!("[{doc}]")).unwrap();
        assert_eq!(decoded, Some(Cached::Present(roles)));
    }
}
