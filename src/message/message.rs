use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use bitflags::bitflags;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use crate::buffers::buffer::Buffer;
use crate::error::{TransportError, TransportResult};
use crate::message::content_type::{ContentReference, ContentType};
use crate::message::message_type::MessageType;
use crate::message::peer_address::{PeerAddress, PeerId};
use crate::util::random::{Random, RngRandom};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MessageOptions: u8 {
        /// keep a TCP connection open after the reply. Meaningless for fire-and-forget requests.
        const KEEP_ALIVE = 0b0000_0001;
        /// the payload may arrive in more than one framing unit, and partial messages are
        ///  forwarded to the application
        const STREAMING = 0b0000_0010;
    }
}

/// The in-memory representation of a protocol message: header fields plus up to
///  [Message::CONTENT_TYPE_LENGTH] typed content slots.
///
/// Each slot holds a content type; the payload itself is stored in a per-type list. The content
///  references record, in slot order, which element of which list a slot refers to: if a type
///  occurs several times, its reference index increments per occurrence.
#[derive(Clone)]
pub struct Message {
    message_id: u32,
    version: u32,
    message_type: MessageType,
    command: u8,
    sender: PeerAddress,
    recipient: PeerAddress,
    options: MessageOptions,

    content_types: [ContentType; Message::CONTENT_TYPE_LENGTH],
    content_references: VecDeque<ContentReference>,

    keys: Vec<PeerId>,
    integers: Vec<i32>,
    longs: Vec<i64>,
    buffers: Vec<Buffer>,
    public_keys: Vec<Bytes>,
    neighbor_sets: Vec<Vec<PeerAddress>>,
    peer_socket_sets: Vec<Vec<SocketAddr>>,

    signature: Option<Bytes>,
    verified: bool,

    done: bool,
    udp: bool,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Message {
    pub const CONTENT_TYPE_LENGTH: usize = 8;

    pub fn new() -> Message {
        Message {
            message_id: 0,
            version: 0,
            message_type: MessageType::Request1,
            command: 0,
            sender: PeerAddress::unspecified(),
            recipient: PeerAddress::unspecified(),
            options: MessageOptions::empty(),
            content_types: [ContentType::Empty; Message::CONTENT_TYPE_LENGTH],
            content_references: VecDeque::new(),
            keys: Vec::new(),
            integers: Vec::new(),
            longs: Vec::new(),
            buffers: Vec::new(),
            public_keys: Vec::new(),
            neighbor_sets: Vec::new(),
            peer_socket_sets: Vec::new(),
            signature: None,
            verified: false,
            done: false,
            udp: false,
            local_addr: None,
            remote_addr: None,
        }
    }

    /// a new request with a random message id
    pub fn request(message_type: MessageType, command: u8, sender: PeerAddress, recipient: PeerAddress) -> Message {
        Message::request_with_random::<RngRandom>(message_type, command, sender, recipient)
    }

    pub(crate) fn request_with_random<R: Random>(message_type: MessageType, command: u8, sender: PeerAddress, recipient: PeerAddress) -> Message {
        let mut result = Message::new();
        result.message_id = R::message_id();
        result.message_type = message_type;
        result.command = command;
        result.sender = sender;
        result.recipient = recipient;
        result
    }

    /// Create the reply to this message, sent from `self_addr` back to this message's sender. Id,
    ///  command, version and keep-alive are preserved.
    pub fn reply(&self, self_addr: PeerAddress, message_type: MessageType) -> Message {
        let mut result = Message::new();
        result.message_id = self.message_id;
        result.version = self.version;
        result.message_type = message_type;
        result.command = self.command;
        result.sender = self_addr;
        result.recipient = self.sender;
        result.udp = self.udp;
        result.options.set(MessageOptions::KEEP_ALIVE, self.is_keep_alive());
        result
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }
    pub fn set_message_id(&mut self, message_id: u32) -> &mut Self {
        self.message_id = message_id;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }
    pub fn set_version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
    pub fn set_message_type(&mut self, message_type: MessageType) -> &mut Self {
        self.message_type = message_type;
        self
    }

    pub fn command(&self) -> u8 {
        self.command
    }
    pub fn set_command(&mut self, command: u8) -> &mut Self {
        self.command = command;
        self
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }
    pub fn set_sender(&mut self, sender: PeerAddress) -> &mut Self {
        self.sender = sender;
        self
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }
    pub fn set_recipient(&mut self, recipient: PeerAddress) -> &mut Self {
        self.recipient = recipient;
        self
    }

    pub fn options(&self) -> MessageOptions {
        self.options
    }
    pub fn set_options(&mut self, options: MessageOptions) -> &mut Self {
        self.options = options;
        self
    }

    pub fn is_keep_alive(&self) -> bool {
        self.options.contains(MessageOptions::KEEP_ALIVE)
    }
    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.options.set(MessageOptions::KEEP_ALIVE, keep_alive);
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.options.contains(MessageOptions::STREAMING)
    }
    pub fn set_streaming(&mut self, streaming: bool) -> &mut Self {
        self.options.set(MessageOptions::STREAMING, streaming);
        self
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_request()
    }

    /// no reply is expected for this message
    pub fn is_fire_and_forget(&self) -> bool {
        self.message_type.is_fire_and_forget()
    }

    /// A received message is done when all its content arrived. Partial streaming messages are
    ///  forwarded with `done == false`.
    pub fn is_done(&self) -> bool {
        self.done
    }
    pub fn set_done(&mut self, done: bool) -> &mut Self {
        self.done = done;
        self
    }

    pub fn is_udp(&self) -> bool {
        self.udp
    }
    pub fn set_udp(&mut self, udp: bool) -> &mut Self {
        self.udp = udp;
        self
    }

    /// for received messages: the local address of the channel the message arrived on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    /// for received messages: the address the message was received from
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
    pub fn set_addresses(&mut self, local_addr: SocketAddr, remote_addr: SocketAddr) -> &mut Self {
        self.local_addr = Some(local_addr);
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }
    pub(crate) fn set_signature(&mut self, signature: Bytes, verified: bool) {
        self.signature = Some(signature);
        self.verified = verified;
    }
    /// for received messages: the signature was checked against the public key
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn content_types(&self) -> &[ContentType; Message::CONTENT_TYPE_LENGTH] {
        &self.content_types
    }

    pub fn content_references(&self) -> &VecDeque<ContentReference> {
        &self.content_references
    }

    pub fn has_content(&self) -> bool {
        self.content_types[0] != ContentType::Empty
    }

    /// `true` if the message carries a public key and is signed with the corresponding
    ///  private key
    pub fn is_signed(&self) -> bool {
        self.content_types[0] == ContentType::PublicKeySignature
    }

    /// Put a content type into the first free slot, returning the reference to the payload it
    ///  stands for.
    pub fn set_content_type(&mut self, content_type: ContentType) -> TransportResult<ContentReference> {
        let mut index = 0;
        for slot in 0..Message::CONTENT_TYPE_LENGTH {
            let existing = self.content_types[slot];
            if existing == ContentType::Empty {
                if content_type == ContentType::PublicKeySignature && slot != 0 {
                    return Err(TransportError::PublicKeySignatureNotFirst);
                }
                self.content_types[slot] = content_type;
                let reference = ContentReference { index, content_type };
                self.content_references.push_back(reference);
                return Ok(reference);
            }
            if existing.shares_index_space(&content_type) {
                index += 1;
            }
        }
        Err(TransportError::TooManyContentTypes(Message::CONTENT_TYPE_LENGTH))
    }

    /// Rebuild the content references from the content types, e.g. after decoding consumed them.
    pub fn restore_content_references(&mut self) {
        self.content_references = self.references_from_content_types();
    }

    /// The content references implied by the content types. Indexes are assigned in order of
    ///  first appearance per type.
    pub fn references_from_content_types(&self) -> VecDeque<ContentReference> {
        let mut result = VecDeque::new();

        let mut counters: FxHashMap<ContentType, usize> = FxHashMap::default();
        for content_type in self.content_types {
            if content_type == ContentType::Empty {
                break;
            }
            let counter_key = if content_type.is_public_key() {
                ContentType::PublicKeySignature
            }
            else {
                content_type
            };
            let counter = counters.entry(counter_key).or_insert(0);
            result.push_back(ContentReference { index: *counter, content_type });
            *counter += 1;
        }
        result
    }

    pub(crate) fn set_content_types(&mut self, content_types: [ContentType; Message::CONTENT_TYPE_LENGTH]) {
        self.content_types = content_types;
        self.restore_content_references();
    }

    pub(crate) fn pop_content_reference(&mut self) -> Option<ContentReference> {
        self.content_references.pop_front()
    }

    pub(crate) fn peek_content_reference(&self) -> Option<&ContentReference> {
        self.content_references.front()
    }

    /// rewind all byte buffers so they can be read again from the start
    pub fn restore_buffers(&mut self) {
        for buffer in &mut self.buffers {
            buffer.reset();
        }
    }

    pub fn add_key(&mut self, key: PeerId) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::Key)?;
        self.keys.push(key);
        Ok(self)
    }
    pub fn key(&self, index: usize) -> Option<&PeerId> {
        self.keys.get(index)
    }
    pub fn keys(&self) -> &[PeerId] {
        &self.keys
    }

    pub fn add_integer(&mut self, value: i32) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::Integer)?;
        self.integers.push(value);
        Ok(self)
    }
    pub fn integer(&self, index: usize) -> Option<i32> {
        self.integers.get(index).cloned()
    }

    pub fn add_long(&mut self, value: i64) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::Long)?;
        self.longs.push(value);
        Ok(self)
    }
    pub fn long(&self, index: usize) -> Option<i64> {
        self.longs.get(index).cloned()
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::ByteBuffer)?;
        self.buffers.push(buffer);
        Ok(self)
    }
    pub fn buffer(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }
    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut Buffer> {
        self.buffers.get_mut(index)
    }
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn add_public_key(&mut self, public_key: Bytes) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::PublicKey)?;
        self.public_keys.push(public_key);
        Ok(self)
    }
    /// add a public key and have the message signed with the corresponding private key on
    ///  encoding. This must be the first content of the message.
    pub fn add_public_key_and_sign(&mut self, public_key: Bytes) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::PublicKeySignature)?;
        self.public_keys.push(public_key);
        Ok(self)
    }
    pub fn public_key(&self, index: usize) -> Option<&Bytes> {
        self.public_keys.get(index)
    }

    pub fn add_neighbors(&mut self, neighbors: Vec<PeerAddress>) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::SetNeighbors)?;
        self.neighbor_sets.push(neighbors);
        Ok(self)
    }
    pub fn neighbors(&self, index: usize) -> Option<&[PeerAddress]> {
        self.neighbor_sets.get(index).map(|n| n.as_slice())
    }

    pub fn add_peer_sockets(&mut self, sockets: Vec<SocketAddr>) -> TransportResult<&mut Self> {
        self.set_content_type(ContentType::SetPeerSocket)?;
        self.peer_socket_sets.push(sockets);
        Ok(self)
    }
    pub fn peer_sockets(&self, index: usize) -> Option<&[SocketAddr]> {
        self.peer_socket_sets.get(index).map(|s| s.as_slice())
    }

    // raw payload storage for the decoder, which fills slots that are already set

    pub(crate) fn push_key(&mut self, key: PeerId) {
        self.keys.push(key);
    }
    pub(crate) fn push_integer(&mut self, value: i32) {
        self.integers.push(value);
    }
    pub(crate) fn push_long(&mut self, value: i64) {
        self.longs.push(value);
    }
    pub(crate) fn push_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }
    pub(crate) fn push_public_key(&mut self, public_key: Bytes) {
        self.public_keys.push(public_key);
    }
    pub(crate) fn push_neighbors(&mut self, neighbors: Vec<PeerAddress>) {
        self.neighbor_sets.push(neighbors);
    }
    pub(crate) fn push_peer_sockets(&mut self, sockets: Vec<SocketAddr>) {
        self.peer_socket_sets.push(sockets);
    }
}

/// Two messages are equal if they are equal on the wire, i.e. transient state like read progress,
///  addresses of the receiving channel or the 'done' flag is ignored. The recipient is compared
///  by id only, since only the id is transmitted.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
            && self.version == other.version
            && self.message_type == other.message_type
            && self.command == other.command
            && self.sender == other.sender
            && self.recipient.peer_id == other.recipient.peer_id
            && self.options == other.options
            && self.content_types == other.content_types
            && self.keys == other.keys
            && self.integers == other.integers
            && self.longs == other.longs
            && self.buffers == other.buffers
            && self.public_keys == other.public_keys
            && self.neighbor_sets == other.neighbor_sets
            && self.peer_socket_sets == other.peer_socket_sets
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{id:{}, type:{:?}, command:{}, from:{:?}, to:{:?}, options:{:?}, content:{:?}, done:{}}}",
               self.message_id, self.message_type, self.command, self.sender, self.recipient.peer_id,
               self.options, &self.content_types[..self.content_types.iter().take_while(|c| **c != ContentType::Empty).count()],
               self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use rstest::rstest;

    #[test]
    fn test_request_draws_message_id() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap();
        let ctx = MockRandom::message_id_context();
        ctx.expect().return_const(4711u32);

        let sender = PeerAddress::new(PeerId::from_number(1), "10.0.0.1".parse().unwrap(), 1, 2);
        let message = Message::request_with_random::<MockRandom>(MessageType::Request3, 9, sender, PeerAddress::unspecified());
        assert_eq!(message.message_id(), 4711);
        assert_eq!(message.command(), 9);
        assert_eq!(message.sender(), &sender);
        assert!(message.is_request());
    }

    fn refs(message: &Message) -> Vec<(usize, ContentType)> {
        message.content_references().iter()
            .map(|r| (r.index, r.content_type))
            .collect()
    }

    #[test]
    fn test_same_type_three_times() {
        let mut message = Message::new();
        message.add_integer(1).unwrap()
            .add_integer(2).unwrap()
            .add_integer(3).unwrap();

        assert_eq!(refs(&message), vec![
            (0, ContentType::Integer),
            (1, ContentType::Integer),
            (2, ContentType::Integer),
        ]);
        assert_eq!(message.integer(2), Some(3));
    }

    #[test]
    fn test_ninth_content_type() {
        let mut message = Message::new();
        for i in 0..8 {
            message.add_long(i).unwrap();
        }
        assert!(matches!(message.add_key(PeerId::ZERO), Err(TransportError::TooManyContentTypes(8))));
        assert!(matches!(message.set_content_type(ContentType::Integer), Err(TransportError::TooManyContentTypes(8))));
    }

    #[test]
    fn test_mixed_types() {
        let mut message = Message::new();
        message.add_key(PeerId::from_number(1)).unwrap()
            .add_integer(5).unwrap()
            .add_key(PeerId::from_number(2)).unwrap()
            .add_buffer(Buffer::from_bytes(Bytes::from_static(b"abc"))).unwrap()
            .add_integer(6).unwrap();

        assert_eq!(refs(&message), vec![
            (0, ContentType::Key),
            (0, ContentType::Integer),
            (1, ContentType::Key),
            (0, ContentType::ByteBuffer),
            (1, ContentType::Integer),
        ]);
    }

    #[test]
    fn test_public_keys_share_index_space() {
        let mut message = Message::new();
        message.add_public_key_and_sign(Bytes::from_static(b"k1")).unwrap()
            .add_integer(1).unwrap()
            .add_public_key(Bytes::from_static(b"k2")).unwrap();

        assert_eq!(refs(&message), vec![
            (0, ContentType::PublicKeySignature),
            (0, ContentType::Integer),
            (1, ContentType::PublicKey),
        ]);
        assert_eq!(message.public_key(1).unwrap().as_ref(), b"k2");
        assert!(message.is_signed());
    }

    #[test]
    fn test_public_key_signature_must_be_first() {
        let mut message = Message::new();
        message.add_integer(1).unwrap();
        assert!(matches!(message.add_public_key_and_sign(Bytes::from_static(b"k")), Err(TransportError::PublicKeySignatureNotFirst)));
        assert_eq!(message.content_types()[1], ContentType::Empty);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![ContentType::Key])]
    #[case::repeated(vec![ContentType::Integer, ContentType::Key, ContentType::Integer, ContentType::Integer])]
    #[case::public_keys(vec![ContentType::PublicKeySignature, ContentType::PublicKey, ContentType::Long, ContentType::PublicKey])]
    #[case::full(vec![ContentType::ByteBuffer; 8])]
    fn test_restore_content_references(#[case] types: Vec<ContentType>) {
        let mut message = Message::new();
        for t in &types {
            message.set_content_type(*t).unwrap();
        }
        let expected = refs(&message);

        message.content_references.clear();
        message.restore_content_references();

        assert_eq!(refs(&message), expected);
    }

    #[test]
    fn test_set_done_honours_argument() {
        let mut message = Message::new();
        message.set_done(true);
        assert!(message.is_done());
        message.set_done(false);
        assert!(!message.is_done());
    }

    #[rstest]
    #[case(MessageOptions::empty(), false, false)]
    #[case(MessageOptions::KEEP_ALIVE, true, false)]
    #[case(MessageOptions::STREAMING, false, true)]
    #[case(MessageOptions::all(), true, true)]
    fn test_options(#[case] options: MessageOptions, #[case] keep_alive: bool, #[case] streaming: bool) {
        let mut message = Message::new();
        message.set_options(options);
        assert_eq!(message.is_keep_alive(), keep_alive);
        assert_eq!(message.is_streaming(), streaming);
        assert_eq!(options.bits() & 1 != 0, keep_alive);
        assert_eq!(options.bits() & 2 != 0, streaming);
    }

    #[test]
    fn test_reply() {
        let sender = PeerAddress::new(PeerId::from_number(1), "1.2.3.4".parse().unwrap(), 1, 2);
        let recipient = PeerAddress::new(PeerId::from_number(2), "5.6.7.8".parse().unwrap(), 3, 4);

        let mut request = Message::request(MessageType::Request1, 3, sender, recipient);
        request.set_keep_alive(true).set_version(9);

        let reply = request.reply(recipient, MessageType::Ok);
        assert_eq!(reply.message_id(), request.message_id());
        assert_eq!(reply.command(), 3);
        assert_eq!(reply.version(), 9);
        assert_eq!(reply.message_type(), MessageType::Ok);
        assert_eq!(reply.sender(), &recipient);
        assert_eq!(reply.recipient(), &sender);
        assert!(reply.is_keep_alive());
        assert!(!reply.is_streaming());
    }
}
