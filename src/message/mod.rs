pub mod content_type;
pub mod message;
pub mod message_type;
pub mod peer_address;
pub mod signature;
