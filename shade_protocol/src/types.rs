// Core ID types for the router protocol.
//
// Every identifier that crosses the wire is a string newtype. Session ids
// are private to one client and one router (they appear only in frame
// headers); client ids are the public handle other group members see as a
// message origin. Group, room, message and transfer ids are chosen by
// clients and are only ever compared, never interpreted.
//
// Size limits live here so that both the router's validation and the
// client's request builders agree on them.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Maximum length of any client-chosen identifier (message, room, group,
/// transfer, target client).
pub const MAX_ID_SIZE: usize = 64;

/// Maximum length of a display name.
pub const MAX_NAME_SIZE: usize = 64;

/// Maximum length of a join passphrase.
pub const MAX_PASSPHRASE_SIZE: usize = 128;

/// Maximum number of random bytes a single `Entropy` request may ask for.
pub const MAX_ENTROPY_SIZE: u32 = 1024;

/// Largest needed-chunk set a consumer may declare in one download poll.
pub const MAX_NEEDED_CHUNKS: usize = 65_536;

/// Number of random bytes behind a router-assigned id (hex-encoded on the
/// wire, so twice as many characters).
const RANDOM_ID_BYTES: usize = 16;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// True if the id fits within `MAX_ID_SIZE`.
            pub fn within_limit(&self) -> bool {
                self.0.len() <= MAX_ID_SIZE
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Router-assigned transport session id. Private to the client.
    SessionId
);
string_id!(
    /// Router-assigned public client id, used as a message origin.
    ClientId
);
string_id!(
    /// Group id. The empty id is the public group.
    GroupId
);
string_id!(
    /// Room id within a group.
    RoomId
);
string_id!(
    /// Client-chosen message id used for dedup and reply routing.
    MessageId
);
string_id!(
    /// Client-chosen transfer id shared by producer and consumers.
    TransferId
);

impl SessionId {
    /// Draw a fresh random session id.
    pub fn random() -> Self {
        Self(random_hex())
    }
}

impl ClientId {
    /// Draw a fresh random client id.
    pub fn random() -> Self {
        Self(random_hex())
    }
}

fn random_hex() -> String {
    let mut bytes = [0u8; RANDOM_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sequence number of one chunk within a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkIndex(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = SessionId::random();
        let b = SessionId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), RANDOM_ID_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_limit() {
        assert!(MessageId::new("m1").within_limit());
        assert!(MessageId::new("x".repeat(MAX_ID_SIZE)).within_limit());
        assert!(!MessageId::new("x".repeat(MAX_ID_SIZE + 1)).within_limit());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&GroupId::new("lobby")).unwrap();
        assert_eq!(json, "\"lobby\"");
    }
}
