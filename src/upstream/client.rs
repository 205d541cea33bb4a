use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ForwarderConfig;
use crate::proxy::context::BoxBody;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Pooled HTTP/1.1 client for forwarded requests, to `http://` and
/// `https://` backends alike.
pub fn build_upstream_client(cfg: &ForwarderConfig) -> UpstreamClient {
    let idle = Duration::from_secs(cfg.keepalive_pool.idle_timeout);

    let mut tcp = HttpConnector::new();
    tcp.set_nodelay(true);
    tcp.set_keepalive(Some(idle));
    tcp.set_connect_timeout(Some(cfg.connect_timeout()));
    tcp.enforce_http(false);

    let tls = if cfg.tls_verify {
        HttpsConnectorBuilder::new().with_webpki_roots()
    } else {
        HttpsConnectorBuilder::new().with_tls_config(unverified_tls_config())
    };
    let connector = tls
        .https_or_http()
        .enable_http1()
        .wrap_connector(tcp);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle)
        .pool_max_idle_per_host(cfg.keepalive_pool.size)
        .build(connector)
}

/// Used when `tls_verify = false`.
fn unverified_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// Keeps the channel encrypted without checking who is on the other end.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
