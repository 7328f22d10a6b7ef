//! Branded ID newtypes.
//!
//! Sessions, pages, and contexts are named by the backend or the host
//! application, so their IDs are opaque strings this crate never mints.
//! [`RequestId`] is the one ID generated locally (UUID v7) and tags each
//! control request so its acknowledgment can be matched.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        ///
        /// The default value is the empty string, used only as a placeholder
        /// in partially built payloads.
        #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// The ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Unwrap into the owned string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        // Lets maps keyed by ID be queried with a plain `&str`.
        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

opaque_id! {
    /// Remote browser session, assigned by the backend.
    SessionId
}

opaque_id! {
    /// Browser tab within a session.
    PageId
}

opaque_id! {
    /// Owning context of a session, such as a conversation.
    ContextId
}

opaque_id! {
    /// Client-generated tag attached to each `control_toggle` and echoed by
    /// backends that support acknowledgment correlation.
    RequestId
}

impl RequestId {
    /// Fresh time-ordered ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn request_id_is_uuid_v7() {
        let id = RequestId::new();
        let parsed = Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
        assert_ne!(id, RequestId::new());
    }

    #[test]
    fn backend_ids_are_kept_verbatim() {
        let id = SessionId::from("browser-7f3a");
        assert_eq!(id.to_string(), "browser-7f3a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"browser-7f3a\"");
        let back: SessionId = serde_json::from_str("\"browser-7f3a\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(SessionId::from("s1"), 1);
        assert_eq!(map.get("s1"), Some(&1));
    }

    #[test]
    fn default_is_empty_placeholder() {
        assert_eq!(ContextId::default().into_inner(), "");
    }
}
