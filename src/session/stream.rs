//! Socket transport: plain TCP or TLS, behind one stream type, plus the
//! codec switch between plain and compressed framing.

use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{ConnectionOptions, SslMode};
use crate::error::Error;
use crate::protocol::codec::{CompressedCodec, PacketCodec};
use crate::protocol::packet::Packet;

/// A backend connection, before or after TLS upgrade
pub enum NetworkStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetworkStream {
    /// Upgrade a plain stream to TLS per the connection options. Must be
    /// called after the SslRequest packet went out.
    pub async fn upgrade_tls(self, host: &str, options: &ConnectionOptions) -> Result<Self, Error> {
        let NetworkStream::Plain(tcp) = self else {
            return Err(Error::Tls("connection is already TLS".to_string()));
        };

        let config = build_client_config(options)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{host}': {e}")))?;
        let connector = TlsConnector::from(Arc::new(config));
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(NetworkStream::Tls(Box::new(tls)))
    }
}

fn build_client_config(options: &ConnectionOptions) -> Result<ClientConfig, Error> {
    match options.ssl_mode {
        SslMode::Disable => Err(Error::Tls("TLS not requested".to_string())),
        SslMode::Trust => {
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier))
                .with_no_client_auth();
            Ok(config)
        }
        SslMode::Require => {
            let mut roots = RootCertStore::empty();
            if let Some(path) = &options.server_ssl_cert {
                let file = std::fs::File::open(path)
                    .map_err(|e| Error::Tls(format!("cannot read {path}: {e}")))?;
                let mut reader = BufReader::new(file);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|e| Error::Tls(e.to_string()))?;
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(e.to_string()))?;
                }
            }
            if roots.is_empty() {
                return Err(Error::Tls(
                    "sslMode=require needs serverSslCert or trustServerCertificate".to_string(),
                ));
            }
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
    }
}

/// Accepts any server certificate (trustServerCertificate=true)
#[derive(Debug)]
struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetworkStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetworkStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NetworkStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NetworkStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Codec that is either plain or compressed framing, switched once after
/// capability negotiation
pub enum WireCodec {
    Plain(PacketCodec),
    Compressed(CompressedCodec),
}

impl WireCodec {
    pub fn plain() -> Self {
        WireCodec::Plain(PacketCodec::default())
    }

    pub fn compressed() -> Self {
        WireCodec::Compressed(CompressedCodec::new())
    }

    /// Reset per-command sequence bookkeeping (compressed framing only)
    pub fn start_command(&mut self) {
        if let WireCodec::Compressed(codec) = self {
            codec.reset_sequence();
        }
    }
}

impl Decoder for WireCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Self::Error> {
        match self {
            WireCodec::Plain(c) => c.decode(src),
            WireCodec::Compressed(c) => c.decode(src),
        }
    }
}

impl Encoder<Packet> for WireCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            WireCodec::Plain(c) => c.encode(item, dst),
            WireCodec::Compressed(c) => c.encode(item, dst),
        }
    }
}
