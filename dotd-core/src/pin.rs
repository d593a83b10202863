use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::error::ErrorStack;
use openssl::sha::sha256;
use openssl::x509::X509Ref;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("pin is not valid Base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode a Base64 SPKI pin into its raw SHA-256 bytes.
pub fn decode_pin(pin: &str) -> Result<Vec<u8>, PinError> {
    Ok(STANDARD.decode(pin)?)
}

/// Encode a raw pin back to the Base64 form used in configuration.
pub fn encode_pin(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// SHA-256 of the certificate's SubjectPublicKeyInfo in DER form.
///
/// This is the value an SPKI pin is compared against, so any change to the
/// public key changes all 32 bytes of the digest.
pub fn spki_sha256(certificate: &X509Ref) -> Result<[u8; 32], ErrorStack> {
    let spki = certificate.public_key()?.public_key_to_der()?;
    Ok(sha256(&spki))
}

/// SHA-256 over the whole DER-encoded certificate.
///
/// The verification-cache key. A re-issued certificate for the same public
/// key hashes differently here, so it misses the cache.
pub fn cert_sha256(certificate: &X509Ref) -> Result<[u8; 32], ErrorStack> {
    Ok(sha256(&certificate.to_der()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_pin() {
        let raw = decode_pin("DPPP3G7LCnpidYBiFiN38CespymEvOsP1HCpoVVPtUM=").unwrap();
        assert_eq!(raw.len(), 32);
        assert_eq!(raw[0], 0x0c);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_pin("not base64 at all!").is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pin = "DPPP3G7LCnpidYBiFiN38CespymEvOsP1HCpoVVPtUM=";
        let raw = decode_pin(pin).unwrap();
        assert_eq!(encode_pin(&raw), pin);
    }

    #[test]
    fn test_decode_empty_is_empty() {
        assert!(decode_pin("").unwrap().is_empty());
    }
}
