use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The type of a message: requests (some of which expect no reply) and the possible replies
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    /// fire-and-forget request, i.e. no reply is expected
    RequestFf1 = 4,
    /// fire-and-forget request, i.e. no reply is expected
    RequestFf2 = 5,
    Ok = 6,
    PartiallyOk = 7,
    NotFound = 8,
    Denied = 9,
    UnknownId = 10,
    Exception = 11,
    Cancel = 12,
    User1 = 13,
    User2 = 14,
}

impl MessageType {
    pub fn is_request(&self) -> bool {
        matches!(self,
            MessageType::Request1 | MessageType::Request2 | MessageType::Request3 | MessageType::Request4
            | MessageType::RequestFf1 | MessageType::RequestFf2)
    }

    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, MessageType::RequestFf1 | MessageType::RequestFf2)
    }
}
