//! Trust-on-first-use against a live TLS endpoint: enroll, pin, re-enroll
//! without prompting, reject a swapped certificate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use radiance_lib::server::tofu::{self, CertDetail, FingerprintStore};
use radiance_lib::server::{Group, Manager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

fn tls_acceptor(cert: &rcgen::CertifiedKey) -> anyhow::Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.cert.der().clone()],
            rustls_pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into()),
        )?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serves every TLS connection with the same JSON body.
async fn private_server(cert: &rcgen::CertifiedKey, body: &'static str) -> anyhow::Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let acceptor = tls_acceptor(cert)?;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                let _ = tls.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = tls.write_all(resp.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    Ok(addr)
}

const CONNECT_CONFIG: &str = "{\"type\":\"shadowsocks\",\"server\":\"127.0.0.1\",\"server_port\":8388,\"password\":\"k\"}";

#[tokio::test]
async fn enrollment_pins_and_skips_the_second_prompt() -> anyhow::Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])?;
    let addr = private_server(&cert, CONNECT_CONFIG).await?;

    let dir = tempfile::tempdir()?;
    let manager = Manager::open(dir.path())?;
    let store = FingerprintStore::open(dir.path())?;

    let prompts = AtomicUsize::new(0);
    let accept_first = |details: &[CertDetail]| -> Option<CertDetail> {
        prompts.fetch_add(1, Ordering::SeqCst);
        details.first().cloned()
    };

    tofu::add_private_server(&manager, &store, "127.0.0.1", addr.port(), "tok-1", "my-private", &accept_first).await?;
    assert_eq!(prompts.load(Ordering::SeqCst), 1);

    let enrolled = manager.get_server_by_tag("my-private").expect("server added");
    assert_eq!(enrolled.group, Group::User);
    assert_eq!(enrolled.kind, "shadowsocks");

    // the pinned fingerprint is on disk with restrictive permissions
    let fingerprint = store.get("127.0.0.1").expect("fingerprint pinned");
    assert_eq!(fingerprint.len(), 40);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join(tofu::FINGERPRINTS_FILE))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // same certificate again: no prompt
    let must_not_prompt = |_: &[CertDetail]| -> Option<CertDetail> { panic!("prompted despite pinned fingerprint") };
    tofu::add_private_server(&manager, &store, "127.0.0.1", addr.port(), "tok-1", "my-private-2", &must_not_prompt)
        .await?;
    assert!(manager.get_server_by_tag("my-private-2").is_some());
    Ok(())
}

#[tokio::test]
async fn swapped_certificate_is_rejected() -> anyhow::Result<()> {
    let original = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])?;
    let imposter = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])?;

    let dir = tempfile::tempdir()?;
    let manager = Manager::open(dir.path())?;
    let store = FingerprintStore::open(dir.path())?;

    // pin the original's fingerprint without ever talking to it
    let original_fp = {
        let addr = private_server(&original, CONNECT_CONFIG).await?;
        let accept = |details: &[CertDetail]| -> Option<CertDetail> { details.first().cloned() };
        tofu::add_private_server(&manager, &store, "127.0.0.1", addr.port(), "tok-1", "pinned", &accept).await?;
        store.get("127.0.0.1").expect("pinned")
    };

    // a different certificate now answers for the same ip
    let addr = private_server(&imposter, CONNECT_CONFIG).await?;
    let must_not_prompt = |_: &[CertDetail]| -> Option<CertDetail> { panic!("prompted for an already-pinned ip") };
    let err = tofu::add_private_server(&manager, &store, "127.0.0.1", addr.port(), "tok-1", "imposter", &must_not_prompt)
        .await
        .expect_err("mismatching certificate must fail");
    assert!(matches!(err, tofu::Error::NoMatchingFingerprint));

    // the pin is untouched
    assert_eq!(store.get("127.0.0.1").expect("still pinned"), original_fp);
    assert!(manager.get_server_by_tag("imposter").is_none());
    Ok(())
}

#[tokio::test]
async fn declining_the_prompt_cancels_enrollment() -> anyhow::Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])?;
    let addr = private_server(&cert, CONNECT_CONFIG).await?;

    let dir = tempfile::tempdir()?;
    let manager = Manager::open(dir.path())?;
    let store = FingerprintStore::open(dir.path())?;

    let decline = |_: &[CertDetail]| -> Option<CertDetail> { None };
    let err = tofu::add_private_server(&manager, &store, "127.0.0.1", addr.port(), "tok-1", "declined", &decline)
        .await
        .expect_err("declined trust must fail");
    assert!(matches!(err, tofu::Error::TrustCancelled));

    assert!(store.get("127.0.0.1").is_none());
    assert!(manager.get_servers().is_empty());
    Ok(())
}
