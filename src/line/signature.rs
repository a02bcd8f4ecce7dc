use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// Checks webhook bodies against the base64 HMAC-SHA256 digest the platform
/// sends in the `x-line-signature` header.
#[derive(Clone)]
pub struct SignatureVerifier {
    channel_secret: Vec<u8>,
}
impl SignatureVerifier {
    pub fn new(channel_secret: impl AsRef<[u8]>) -> Self {
        Self {
            channel_secret: channel_secret.as_ref().to_vec(),
        }
    }

    /// Must be given the raw body exactly as received, before any JSON parsing.
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let expected = match general_purpose::STANDARD.decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        // verify_slice compares in constant time.
        self.mac(body).verify_slice(&expected).is_ok()
    }

    #[cfg(test)]
    pub fn sign(&self, body: &[u8]) -> String {
        general_purpose::STANDARD.encode(self.mac(body).finalize().into_bytes())
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.channel_secret)
            .expect("HMAC can take key of any size");
        mac.update(body);
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"destination":"U0","events":[]}"#;

    #[test]
    fn test_sign_format() {
        let verifier = SignatureVerifier::new("channel-secret");
        let signature = verifier.sign(BODY);

        // 32 byte digest, padded base64.
        assert_eq!(signature.len(), 44);
        assert!(signature.ends_with('='));
        assert_eq!(general_purpose::STANDARD.decode(&signature).unwrap().len(), 32);
    }

    #[test]
    fn test_known_digest() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let verifier = SignatureVerifier::new("key");
        let signature = verifier.sign(b"The quick brown fox jumps over the lazy dog");
        assert_eq!(signature, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
        assert!(verifier.verify(
            b"The quick brown fox jumps over the lazy dog",
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        ));
    }

    #[test]
    fn test_accepts_valid_signature() {
        let verifier = SignatureVerifier::new("channel-secret");
        let signature = verifier.sign(BODY);
        assert!(verifier.verify(BODY, &signature));
        assert!(verifier.verify(BODY, &format!(" {signature} ")));
    }

    #[test]
    fn test_rejects_tampered_body() {
        let verifier = SignatureVerifier::new("channel-secret");
        let signature = verifier.sign(BODY);
        assert!(!verifier.verify(br#"{"destination":"U1","events":[]}"#, &signature));
    }

    #[test]
    fn test_rejects_other_secret() {
        let signature = SignatureVerifier::new("someone-else").sign(BODY);
        assert!(!SignatureVerifier::new("channel-secret").verify(BODY, &signature));
    }

    #[test]
    fn test_rejects_garbage() {
        let verifier = SignatureVerifier::new("channel-secret");
        assert!(!verifier.verify(BODY, ""));
        assert!(!verifier.verify(BODY, "not base64 at all!"));
        assert!(!verifier.verify(BODY, "c2hvcnQ="));
    }
}
