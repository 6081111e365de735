use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// Signs outgoing messages that carry a `PublicKeySignature` and verifies incoming ones. The
///  signature covers all bytes of the encoded message preceding it.
///
/// This is an injection point for cryptography, which lives outside the transport core.
#[cfg_attr(test, automock)]
pub trait SignatureFactory: Send + Sync + 'static {
    /// sign with the private key corresponding to the message's public key
    fn sign(&self, public_key: &[u8], message: &[u8]) -> anyhow::Result<Bytes>;

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}
