use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The kind of payload a message's content slot refers to. Content types are transmitted as
///  4 bit values, so there can be at most 16 of them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContentType {
    #[default]
    Empty = 0,
    /// 160 bit key
    Key = 1,
    /// a set of peer addresses
    SetNeighbors = 2,
    /// opaque bytes with a declared length - the only content that may be streamed
    ByteBuffer = 3,
    Long = 4,
    Integer = 5,
    /// a public key, with the message being signed by the corresponding private key
    PublicKeySignature = 6,
    PublicKey = 7,
    /// a set of socket addresses
    SetPeerSocket = 8,
}

impl ContentType {
    /// `PublicKey` and `PublicKeySignature` share the same storage and therefore the same
    ///  reference index space
    pub fn is_public_key(&self) -> bool {
        matches!(self, ContentType::PublicKey | ContentType::PublicKeySignature)
    }

    pub(crate) fn shares_index_space(&self, other: &ContentType) -> bool {
        self == other || (self.is_public_key() && other.is_public_key())
    }
}

/// Where the payload of a content slot is stored: the `index`th payload of its type
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ContentReference {
    pub index: usize,
    pub content_type: ContentType,
}
