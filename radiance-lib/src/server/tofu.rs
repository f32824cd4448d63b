//! Trust-on-first-use enrollment for private servers.
//!
//! The first connection harvests the peer's certificate chain with
//! verification disabled; the user confirms a fingerprint which is then
//! pinned. Every later connection is made through a client whose TLS
//! verifier rejects anything but the pinned certificate.

use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use x509_parser::prelude::{ASN1Time, FromDer, X509Certificate};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, io};

use super::{Group, Manager, Server};
use crate::dirs;

pub const FINGERPRINTS_FILE: &str = "trusted_server_fingerprints.json";
const FILE_MODE: u32 = 0o600;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("trust decision cancelled")]
    TrustCancelled,
    #[error("no matching fingerprint for peer certificate")]
    NoMatchingFingerprint,
    #[error("no peer certificates observed")]
    NoPeerCertificates,
    #[error("no trusted fingerprint recorded for {0}")]
    NotEnrolled(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("certificate parse error: {0}")]
    X509(String),
    #[error(transparent)]
    Server(#[from] super::Error),
}

/// What the user is asked to confirm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertDetail {
    /// SHA-1 over the DER encoding, lowercase hex.
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: i64,
    pub not_after: i64,
}

/// Synchronous trust prompt; `None` declines.
pub type TrustCallback<'a> = &'a (dyn Fn(&[CertDetail]) -> Option<CertDetail> + Send + Sync);

/// `server-IP → SHA-1 fingerprint`, persisted with restrictive permissions.
#[derive(Clone)]
pub struct FingerprintStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FingerprintStore {
    pub fn open(data_dir: &Path) -> Result<FingerprintStore, Error> {
        let path = data_dir.join(FINGERPRINTS_FILE);
        let map = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::IO(e)),
        };
        Ok(FingerprintStore {
            inner: Arc::new(StoreInner {
                path,
                map: Mutex::new(map),
            }),
        })
    }

    pub fn get(&self, ip: &str) -> Option<String> {
        self.lock().get(ip).cloned()
    }

    pub fn put(&self, ip: &str, fingerprint: &str) -> Result<(), Error> {
        let mut map = self.lock();
        map.insert(ip.to_string(), fingerprint.to_string());
        let bytes = serde_json::to_vec_pretty(&*map)?;
        dirs::write_atomic(&self.inner.path, &bytes, FILE_MODE)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.inner.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Enrolls `ip:port` into the user group under `tag`.
///
/// On first contact the observed certificates go through `trust_cb`; a
/// pinned connection then fetches the server's connect config.
pub async fn add_private_server(
    manager: &Manager,
    store: &FingerprintStore,
    ip: &str,
    port: u16,
    access_token: &str,
    tag: &str,
    trust_cb: TrustCallback<'_>,
) -> Result<(), Error> {
    let details = probe_certificates(ip, port).await?;
    let fingerprint = match store.get(ip) {
        Some(trusted) => {
            if !details.iter().any(|d| d.fingerprint == trusted) {
                return Err(Error::NoMatchingFingerprint);
            }
            trusted
        }
        None => {
            let chosen = trust_cb(&details).ok_or(Error::TrustCancelled)?;
            if !details.iter().any(|d| d.fingerprint == chosen.fingerprint) {
                return Err(Error::TrustCancelled);
            }
            store.put(ip, &chosen.fingerprint)?;
            chosen.fingerprint
        }
    };

    let client = pinned_client(&fingerprint)?;
    let url = format!("https://{ip}:{port}/api/v1/connect-config?token={access_token}");
    let blob: serde_json::Value = client
        .get(url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let server = server_from_blob(tag, blob)?;
    let skipped = manager.add_servers(Group::User, vec![server])?;
    if let Some(tag) = skipped.into_iter().next() {
        return Err(Error::Server(super::Error::DuplicateTag(tag)));
    }
    Ok(())
}

pub async fn invite_to_private_server(
    store: &FingerprintStore,
    ip: &str,
    port: u16,
    access_token: &str,
    invite_name: &str,
) -> Result<String, Error> {
    let client = enrolled_client(store, ip)?;
    let url = format!("https://{ip}:{port}/api/v1/invite?token={access_token}&name={invite_name}");
    let invite = client
        .post(url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(invite)
}

pub async fn revoke_private_server_invite(
    store: &FingerprintStore,
    ip: &str,
    port: u16,
    access_token: &str,
    invite_name: &str,
) -> Result<(), Error> {
    let client = enrolled_client(store, ip)?;
    let url = format!("https://{ip}:{port}/api/v1/revoke?token={access_token}&name={invite_name}");
    client
        .post(url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

fn enrolled_client(store: &FingerprintStore, ip: &str) -> Result<reqwest::Client, Error> {
    let fingerprint = store.get(ip).ok_or_else(|| Error::NotEnrolled(ip.to_string()))?;
    pinned_client(&fingerprint)
}

fn server_from_blob(tag: &str, blob: serde_json::Value) -> Result<Server, Error> {
    let mut options = match blob {
        serde_json::Value::Object(map) => map,
        _ => return Err(Error::Json(serde::de::Error::custom("connect config is not an object"))),
    };
    let kind = options
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "shadowsocks".to_string());
    options.remove("tag");
    Ok(Server {
        group: Group::User,
        tag: tag.to_string(),
        kind,
        options,
        location: None,
    })
}

/// TLS handshake with verification disabled, returning the details of every
/// certificate the peer presented.
async fn probe_certificates(ip: &str, port: u16) -> Result<Vec<CertDetail>, Error> {
    let verifier = Arc::new(CaptureVerifier::new());
    let client = client_with_verifier(verifier.clone())?;
    // the request itself may fail, the handshake capture is what matters
    let _ = client
        .get(format!("https://{ip}:{port}/"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;

    let seen = verifier.seen();
    if seen.is_empty() {
        return Err(Error::NoPeerCertificates);
    }
    seen.iter().map(|der| cert_detail(der)).collect()
}

fn pinned_client(fingerprint: &str) -> Result<reqwest::Client, Error> {
    client_with_verifier(Arc::new(PinnedVerifier::new(fingerprint.to_string())))
}

fn client_with_verifier(verifier: Arc<dyn ServerCertVerifier>) -> Result<reqwest::Client, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(reqwest::Client::builder().use_preconfigured_tls(config).build()?)
}

pub(crate) fn sha1_hex(der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

fn cert_detail(der: &[u8]) -> Result<CertDetail, Error> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| Error::X509(e.to_string()))?;
    Ok(CertDetail {
        fingerprint: sha1_hex(der),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

#[derive(Debug)]
struct CaptureVerifier {
    seen: Mutex<Vec<Vec<u8>>>,
    supported: WebPkiSupportedAlgorithms,
}

impl CaptureVerifier {
    fn new() -> CaptureVerifier {
        CaptureVerifier {
            seen: Mutex::new(Vec::new()),
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }

    fn seen(&self) -> Vec<Vec<u8>> {
        match self.seen.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ServerCertVerifier for CaptureVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.clear();
        seen.push(end_entity.as_ref().to_vec());
        for intermediate in intermediates {
            seen.push(intermediate.as_ref().to_vec());
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Accepts only a peer whose leaf matches the pinned SHA-1 fingerprint and
/// whose validity window covers now.
#[derive(Debug)]
struct PinnedVerifier {
    fingerprint: String,
    supported: WebPkiSupportedAlgorithms,
}

impl PinnedVerifier {
    fn new(fingerprint: String) -> PinnedVerifier {
        PinnedVerifier {
            fingerprint,
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if sha1_hex(end_entity.as_ref()) != self.fingerprint {
            return Err(rustls::Error::General("peer certificate fingerprint mismatch".to_string()));
        }
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("unparseable peer certificate: {e}")))?;
        let at = ASN1Time::from_timestamp(now.as_secs() as i64)
            .map_err(|e| rustls::Error::General(format!("invalid verification time: {e}")))?;
        if !cert.validity().is_valid_at(at) {
            return Err(rustls::Error::General("peer certificate outside validity window".to_string()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_store_round_trips_with_restrictive_mode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FingerprintStore::open(dir.path())?;
            assert_eq!(store.get("203.0.113.9"), None);
            store.put("203.0.113.9", "aa00bb11")?;
        }
        let store = FingerprintStore::open(dir.path())?;
        assert_eq!(store.get("203.0.113.9").as_deref(), Some("aa00bb11"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(FINGERPRINTS_FILE))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[test]
    fn cert_detail_extracts_fields_from_der() -> anyhow::Result<()> {
        let key = rcgen::generate_simple_self_signed(vec!["pserver.example.net".to_string()])?;
        let der = key.cert.der();

        let detail = cert_detail(der.as_ref())?;
        assert_eq!(detail.fingerprint.len(), 40);
        assert_eq!(detail.fingerprint, sha1_hex(der.as_ref()));
        assert!(detail.not_before < detail.not_after);
        Ok(())
    }

    #[test]
    fn server_from_blob_moves_type_out_of_options() -> anyhow::Result<()> {
        let blob = serde_json::json!({
            "type": "hysteria2",
            "server": "203.0.113.9",
            "server_port": 8443,
            "password": "s3cret"
        });
        let server = server_from_blob("my-private", blob)?;
        assert_eq!(server.kind, "hysteria2");
        assert_eq!(server.tag, "my-private");
        assert_eq!(server.group, Group::User);
        assert!(server.options.contains_key("server"));
        assert!(!server.options.contains_key("type"));
        Ok(())
    }
}
