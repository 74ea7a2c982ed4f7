use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dbprobe_core::records::CONNECT_TIMEOUT_SECS;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::{ConnectionError, Prober};

/// Probes PostgreSQL targets with `tokio-postgres`.
///
/// TLS is negotiated according to the target's `sslmode` (`prefer` when the
/// target does not say). Server certificates are not verified, the same as
/// libpq's `sslmode=require`.
#[derive(Clone)]
pub struct PostgresProber {
    tls: MakeRustlsConnect,
}

impl PostgresProber {
    pub fn new() -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(EncryptOnlyVerifier(provider)))
            .with_no_client_auth();
        Ok(Self {
            tls: MakeRustlsConnect::new(config),
        })
    }
}

pub struct PostgresHandle {
    client: Client,
    connection: JoinHandle<()>,
}

#[async_trait]
impl Prober for PostgresProber {
    type Handle = PostgresHandle;

    async fn open(&self, target: &str) -> Result<PostgresHandle, ConnectionError> {
        let config = parse_target(target)?;
        // connect_timeout only covers the TCP connect, not the startup handshake.
        let deadline = config
            .get_connect_timeout()
            .copied()
            .unwrap_or(Duration::from_secs(CONNECT_TIMEOUT_SECS));

        let (client, connection) =
            match tokio::time::timeout(deadline, config.connect(self.tls.clone())).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(err)) => return Err(classify_connection_error(&err)),
                Err(_) => {
                    return Err(ConnectionError::new(
                        "Connection timed out.",
                        format!("no startup response within {}s", deadline.as_secs()),
                    ));
                }
            };
        let connection = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!("Connection closed with error: {err}");
            }
        });
        Ok(PostgresHandle { client, connection })
    }

    async fn ping(&self, handle: &mut PostgresHandle) -> Result<(), ConnectionError> {
        match handle.client.simple_query("SELECT 1").await {
            Ok(_) => Ok(()),
            Err(err) => Err(classify_ping_error(&err)),
        }
    }

    async fn close(&self, handle: PostgresHandle) {
        let PostgresHandle {
            client,
            mut connection,
        } = handle;
        drop(client);
        let grace = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        if tokio::time::timeout(grace, &mut connection).await.is_err() {
            tracing::debug!("Connection did not shut down in time, aborting");
            connection.abort();
        }
    }
}

fn parse_target(target: &str) -> Result<Config, ConnectionError> {
    target
        .parse::<Config>()
        .map_err(|err| ConnectionError::new("Connection target is malformed.", err.to_string()))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct EncryptOnlyVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for EncryptOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn classify_connection_error(err: &tokio_postgres::Error) -> ConnectionError {
    use tokio_postgres::error::SqlState;

    if let Some(db_err) = err.as_db_error() {
        let detail = err.to_string();
        match db_err.code() {
            &SqlState::INVALID_PASSWORD => {
                return ConnectionError::new("Password authentication failed.", detail);
            }
            &SqlState::INVALID_AUTHORIZATION_SPECIFICATION => {
                return ConnectionError::new("User does not exist or lacks permission.", detail);
            }
            &SqlState::INVALID_CATALOG_NAME => {
                return ConnectionError::new("Database does not exist.", detail);
            }
            _ => {}
        }
        return ConnectionError::new(db_err.message().to_string(), detail);
    }

    let detail = err.to_string();
    let lower = detail.to_lowercase();
    if lower.contains("connection refused") {
        ConnectionError::new(
            "Unable to reach the database host (connection refused).",
            detail,
        )
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ConnectionError::new("Connection timed out.", detail)
    } else {
        ConnectionError::new("Failed to connect to the database.", detail)
    }
}

fn classify_ping_error(err: &tokio_postgres::Error) -> ConnectionError {
    let detail = err.to_string();
    match err.as_db_error() {
        Some(db_err) => ConnectionError::new(db_err.message().to_string(), detail),
        None if err.is_closed() => {
            ConnectionError::new("Connection closed before the liveness check.", detail)
        }
        None => ConnectionError::new("Liveness check failed.", detail),
    }
}
