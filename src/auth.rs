//! Packet authentication.
//!
//! Control packets and the serialized manifest end with a 64-byte
//! HMAC-SHA-512 signature over all preceding bytes. The MAC key is the
//! SHA-512 digest of the configured secret string; both ends must derive
//! it exactly this way for wire compatibility.

use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};

use crate::error::Error;

type HmacSha512 = Hmac<Sha512>;

/// Length of the signature trailer on signed structures.
pub const SIGNATURE_LEN: usize = 64;

/// Keyed signer/verifier shared by the wire codec and the manifest codec.
#[derive(Clone)]
pub struct AuthKey {
    key: [u8; 64],
}

impl AuthKey {
    /// Derive the MAC key from the shared secret as `SHA-512(secret)`.
    pub fn derive(secret: &str) -> Self {
        let digest = Sha512::digest(secret.as_bytes());
        let mut key = [0u8; 64];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn mac(&self) -> HmacSha512 {
        HmacSha512::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }

    /// Sign `data`, returning the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = self.mac();
        mac.update(data);
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&mac.finalize().into_bytes());
        sig
    }

    /// Sign the current contents of `buf` and append the signature.
    pub fn append_signature(&self, buf: &mut BytesMut) {
        let sig = self.sign(buf);
        buf.put_slice(&sig);
    }

    /// Verify a trailing signature, returning the signed body on success.
    /// `what` names the structure for the error message.
    pub fn verify_trailing<'a>(
        &self,
        data: &'a [u8],
        what: &'static str,
    ) -> Result<&'a [u8], Error> {
        if data.len() < SIGNATURE_LEN {
            return Err(Error::TruncatedPacket {
                what,
                got: data.len(),
            });
        }
        let (body, sig) = data.split_at(data.len() - SIGNATURE_LEN);
        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(sig)
            .map_err(|_| Error::InvalidSignature(what))?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_secret_same_signature() {
        let a = AuthKey::derive("shared secret");
        let b = AuthKey::derive("shared secret");
        assert_eq!(a.sign(b"payload"), b.sign(b"payload"));
    }

    #[test]
    fn different_secret_different_signature() {
        let a = AuthKey::derive("one");
        let b = AuthKey::derive("two");
        assert_ne!(a.sign(b"payload"), b.sign(b"payload"));
    }

    #[test]
    fn trailer_roundtrip() {
        let key = AuthKey::derive("k");
        let mut buf = BytesMut::from(&b"some signed body"[..]);
        key.append_signature(&mut buf);
        let body = key.verify_trailing(&buf, "test").unwrap();
        assert_eq!(body, b"some signed body");
    }

    #[test]
    fn bit_flip_fails_verification() {
        let key = AuthKey::derive("k");
        let mut buf = BytesMut::from(&b"some signed body"[..]);
        key.append_signature(&mut buf);
        for i in 0..buf.len() {
            let mut tampered = buf.to_vec();
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    key.verify_trailing(&tampered, "test"),
                    Err(Error::InvalidSignature(_))
                ),
                "flip at byte {i} not detected"
            );
        }
    }

    #[test]
    fn short_input_is_truncated() {
        let key = AuthKey::derive("k");
        assert!(matches!(
            key.verify_trailing(&[0u8; 12], "test"),
            Err(Error::TruncatedPacket { .. })
        ));
    }
}
