//! Certificate verification policy: hostname matching, SPKI pinning, and
//! the short-lived verification cache layered over them.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libc::c_int;
use openssl::nid::Nid;
use openssl::x509::{X509Ref, X509VerifyResult};
use tracing::warn;

use crate::pin::{cert_sha256, spki_sha256};

/// Outcome of inspecting a leaf certificate against local policy.
///
/// The numeric scheme mirrors how the TLS engine combines the verdict with
/// the chain result: `Pinned` overrides a failed chain, `Reject` overrides a
/// successful one, `HostnameOnly` leaves the chain result as it stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Reject,
    HostnameOnly,
    Pinned,
}

/// A leaf-certificate policy check.
///
/// `Send + Sync` because OpenSSL insists its verify callbacks are shareable
/// across threads, even though this process never calls them off-thread.
pub trait Verify: Send + Sync {
    fn verify(&self, certificate: &X509Ref) -> Verdict;
}

/// Chain errors the policy verdict may override.
///
/// Everything else (expiry, revocation, signature corruption, ...) stays
/// fatal no matter what the pin says. Widening this list is a security bug.
const OVERRIDABLE: [c_int; 5] = [
    openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT,
    openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT,
    openssl_sys::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN,
    openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
    openssl_sys::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE,
];

pub(crate) fn override_allowed(error: X509VerifyResult) -> bool {
    OVERRIDABLE.contains(&error.as_raw())
}

/// Case-insensitive, right-anchored certificate name matching.
///
/// A leading `*.` stands in for exactly one DNS label, and only when the
/// certificate name carries at least two dots of its own, so `*.com` never
/// matches anything while `*.domain.com` matches `www.domain.com`.
fn match_name(hostname: &str, name: &[u8]) -> bool {
    if name.is_empty() || name.contains(&0) {
        return false;
    }
    let host = hostname.as_bytes();
    if host.eq_ignore_ascii_case(name) {
        return true;
    }

    let Some(rest) = name.strip_prefix(b"*.") else {
        return false;
    };
    if !rest.contains(&b'.') {
        return false;
    }
    let Some(dot) = host.iter().position(|&b| b == b'.') else {
        return false;
    };
    let (label, suffix) = host.split_at(dot);
    !label.is_empty() && suffix[1..].eq_ignore_ascii_case(rest)
}

/// Check a hostname against a certificate's names.
///
/// DNS-type subject alternative names take precedence; the subject CN is
/// only consulted when the certificate has no SAN extension at all. An
/// empty hostname means "do not check".
pub fn verify_hostname(certificate: &X509Ref, hostname: &str) -> bool {
    if hostname.is_empty() {
        return true;
    }
    if let Some(sans) = certificate.subject_alt_names() {
        return sans
            .iter()
            .any(|name| name.dnsname().is_some_and(|dns| match_name(hostname, dns.as_bytes())));
    }
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .is_some_and(|cn| match_name(hostname, cn.data().as_slice()))
}

/// The per-upstream hostname + SPKI pin policy.
pub struct PolicyVerifier {
    hostname: String,
    pin: Vec<u8>,
}

impl PolicyVerifier {
    pub fn new(hostname: String, pin: Vec<u8>) -> Self {
        Self { hostname, pin }
    }
}

impl Verify for PolicyVerifier {
    fn verify(&self, certificate: &X509Ref) -> Verdict {
        let pin_ok = if self.pin.is_empty() {
            true
        } else {
            spki_sha256(certificate).is_ok_and(|hash| hash[..] == self.pin[..])
        };
        if !pin_ok {
            warn!("upstream certificate public key does not match the configured pin");
        }

        let host_ok = verify_hostname(certificate, &self.hostname);
        if !host_ok && !self.hostname.is_empty() {
            warn!(hostname = %self.hostname, "upstream certificate name mismatch");
        }

        match (pin_ok, host_ok) {
            (true, true) => {
                if self.pin.is_empty() && !self.hostname.is_empty() {
                    Verdict::HostnameOnly
                } else {
                    Verdict::Pinned
                }
            }
            _ => Verdict::Reject,
        }
    }
}

/// Single-slot TTL cache over full-leaf-certificate hashes.
///
/// Keyed by the hash of the entire certificate rather than the public key:
/// a re-issued certificate for the same key must re-verify.
pub struct VerifyCache {
    slot: Mutex<Option<([u8; 32], Instant)>>,
    ttl: Duration,
}

impl VerifyCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    fn check(&self, hash: &[u8; 32]) -> bool {
        let slot = self.slot.lock().expect("verify cache lock");
        slot.as_ref()
            .is_some_and(|(cached, expiry)| cached == hash && Instant::now() <= *expiry)
    }

    fn store(&self, hash: [u8; 32]) {
        let mut slot = self.slot.lock().expect("verify cache lock");
        *slot = Some((hash, Instant::now() + self.ttl));
    }
}

/// A verifier wrapped by the cache: a hit answers `HostnameOnly` without
/// consulting the inner policy, and only `HostnameOnly` results are cached.
pub struct CachedVerifier {
    cache: Arc<VerifyCache>,
    inner: Arc<dyn Verify>,
}

impl CachedVerifier {
    pub fn new(cache: Arc<VerifyCache>, inner: Arc<dyn Verify>) -> Self {
        Self { cache, inner }
    }
}

impl Verify for CachedVerifier {
    fn verify(&self, certificate: &X509Ref) -> Verdict {
        let Ok(hash) = cert_sha256(certificate) else {
            return self.inner.verify(certificate);
        };
        if self.cache.check(&hash) {
            return Verdict::HostnameOnly;
        }
        let verdict = self.inner.verify(certificate);
        if verdict == Verdict::HostnameOnly {
            self.cache.store(hash);
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::spki_sha256;
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::x509::extension::SubjectAlternativeName;
    use openssl::x509::{X509NameBuilder, X509};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_cert(cn: &str, sans: &[&str]) -> X509 {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        if !sans.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for entry in sans {
                san.dns(entry);
            }
            let ext = san.build(&builder.x509v3_context(None, None)).unwrap();
            builder.append_extension(ext).unwrap();
        }
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    #[test]
    fn test_wildcard_rules() {
        assert!(match_name("www.example.com", b"*.example.com"));
        assert!(match_name("www.EXAMPLE.com", b"*.example.com"));
        assert!(!match_name("example.com", b"*.example.com"));
        assert!(!match_name("a.b.example.com", b"*.example.com"));
        assert!(!match_name("www.example.com", b"*.com"));
        assert!(!match_name("", b"*.example.com"));
        assert!(!match_name(".example.com", b"*.example.com"));
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        assert!(match_name("DNS.Example.Com", b"dns.example.com"));
        assert!(!match_name("dns.example.org", b"dns.example.com"));
    }

    #[test]
    fn test_embedded_nul_rejects() {
        assert!(!match_name("dns.example.com", b"dns.example.com\0evil"));
        assert!(!match_name("dns.example.com", b""));
    }

    #[test]
    fn test_hostname_prefers_san_over_cn() {
        let cert = make_cert("cn.example.com", &["san.example.com"]);
        assert!(verify_hostname(&cert, "san.example.com"));
        // CN must be ignored once a SAN extension exists.
        assert!(!verify_hostname(&cert, "cn.example.com"));
    }

    #[test]
    fn test_hostname_falls_back_to_cn() {
        let cert = make_cert("cn.example.com", &[]);
        assert!(verify_hostname(&cert, "cn.example.com"));
        assert!(!verify_hostname(&cert, "other.example.com"));
    }

    #[test]
    fn test_empty_hostname_skips_check() {
        let cert = make_cert("whatever.example", &[]);
        assert!(verify_hostname(&cert, ""));
    }

    #[test]
    fn test_wildcard_certificate_end_to_end() {
        let cert = make_cert("*.example.com", &[]);
        assert!(verify_hostname(&cert, "www.example.com"));
        assert!(verify_hostname(&cert, "www.EXAMPLE.com"));
        assert!(!verify_hostname(&cert, "example.com"));
        assert!(!verify_hostname(&cert, "a.b.example.com"));
    }

    #[test]
    fn test_policy_verdicts() {
        let cert = make_cert("dns.example.com", &[]);
        let good_pin = spki_sha256(&cert).unwrap().to_vec();

        let both = PolicyVerifier::new("dns.example.com".into(), good_pin.clone());
        assert_eq!(both.verify(&cert), Verdict::Pinned);

        let hostname_only = PolicyVerifier::new("dns.example.com".into(), Vec::new());
        assert_eq!(hostname_only.verify(&cert), Verdict::HostnameOnly);

        let pin_only = PolicyVerifier::new(String::new(), good_pin);
        assert_eq!(pin_only.verify(&cert), Verdict::Pinned);

        let bad_pin = PolicyVerifier::new("dns.example.com".into(), vec![0u8; 32]);
        assert_eq!(bad_pin.verify(&cert), Verdict::Reject);

        let bad_host = PolicyVerifier::new("wrong.example.com".into(), Vec::new());
        assert_eq!(bad_host.verify(&cert), Verdict::Reject);

        let nothing = PolicyVerifier::new(String::new(), Vec::new());
        assert_eq!(nothing.verify(&cert), Verdict::Pinned);
    }

    #[test]
    fn test_pin_changes_with_public_key() {
        let first = make_cert("dns.example.com", &[]);
        let second = make_cert("dns.example.com", &[]);
        assert_ne!(
            spki_sha256(&first).unwrap(),
            spki_sha256(&second).unwrap()
        );
    }

    struct Counting {
        verdict: Verdict,
        calls: AtomicUsize,
    }

    impl Verify for Counting {
        fn verify(&self, _certificate: &X509Ref) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    #[test]
    fn test_cache_hit_skips_inner_verifier() {
        let cert = make_cert("dns.example.com", &[]);
        let inner = Arc::new(Counting {
            verdict: Verdict::HostnameOnly,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(VerifyCache::new(VerifyCache::DEFAULT_TTL));
        let cached = CachedVerifier::new(cache, inner.clone());

        assert_eq!(cached.verify(&cert), Verdict::HostnameOnly);
        assert_eq!(cached.verify(&cert), Verdict::HostnameOnly);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_misses_on_different_certificate() {
        let first = make_cert("dns.example.com", &[]);
        let second = make_cert("dns.example.com", &[]);
        let inner = Arc::new(Counting {
            verdict: Verdict::HostnameOnly,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(VerifyCache::new(VerifyCache::DEFAULT_TTL));
        let cached = CachedVerifier::new(cache, inner.clone());

        cached.verify(&first);
        cached.verify(&second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_expires() {
        let cert = make_cert("dns.example.com", &[]);
        let inner = Arc::new(Counting {
            verdict: Verdict::HostnameOnly,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(VerifyCache::new(Duration::from_secs(0)));
        let cached = CachedVerifier::new(cache, inner.clone());

        cached.verify(&cert);
        std::thread::sleep(Duration::from_millis(5));
        cached.verify(&cert);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_only_stores_hostname_verdicts() {
        let cert = make_cert("dns.example.com", &[]);
        let inner = Arc::new(Counting {
            verdict: Verdict::Pinned,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(VerifyCache::new(VerifyCache::DEFAULT_TTL));
        let cached = CachedVerifier::new(cache, inner.clone());

        assert_eq!(cached.verify(&cert), Verdict::Pinned);
        assert_eq!(cached.verify(&cert), Verdict::Pinned);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_override_list_is_exact() {
        use openssl_sys as ffi;
        assert!(override_allowed(unsafe {
            X509VerifyResult::from_raw(ffi::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT)
        }));
        assert!(override_allowed(unsafe {
            X509VerifyResult::from_raw(ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY)
        }));
        assert!(!override_allowed(unsafe {
            X509VerifyResult::from_raw(ffi::X509_V_ERR_CERT_HAS_EXPIRED)
        }));
        assert!(!override_allowed(X509VerifyResult::OK));
    }
}
