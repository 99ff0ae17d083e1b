//! A thin `RaftKv` gRPC client (spec §6.3 `Lookup`/`Update`), for admin
//! tooling and tests that want to drive a running partition without pulling
//! in the full `Cluster` façade.
//!
//! Generalizes the teacher's "build a configured client" pattern
//! (`ClientConfig` in → a ready-to-use client out, with optional mTLS) from
//! `reqwest` onto `tonic`'s own TLS support.

use std::fs;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::errors::ClusterError;
use crate::grpc::proto::raft_kv_client::RaftKvClient;
use crate::grpc::proto::ClientRequest;
use crate::types::{LookupRequest, Query, Response, ResponseField, UpdateRequest};

/// Configuration for building a [`RaftKvClient`].
pub struct ClientConfig {
    /// `http(s)://host:port` or bare `host:port` (treated as `http://`).
    pub target_addr: String,
    pub tls_ca: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

/// Builds a channel to a `RaftKv` endpoint, configuring mTLS when the caller
/// supplied both a client cert and key (`config.rs::validate` enforces the
/// same all-or-nothing pairing for the server side).
pub async fn build_client(
    config: &ClientConfig,
) -> Result<RaftKvClient<Channel>, Box<dyn std::error::Error + Send + Sync>> {
    let uri = if config.target_addr.starts_with("http") {
        config.target_addr.clone()
    } else {
        format!("http://{}", config.target_addr)
    };
    let mut endpoint = Endpoint::from_shared(uri)?;

    if let Some(tls) = configure_mtls(config)? {
        endpoint = endpoint.tls_config(tls)?;
    }

    let channel = endpoint.connect().await?;
    Ok(RaftKvClient::new(channel))
}

fn configure_mtls(
    config: &ClientConfig,
) -> Result<Option<ClientTlsConfig>, Box<dyn std::error::Error + Send + Sync>> {
    if config.tls_cert.is_none() && config.tls_key.is_none() && config.tls_ca.is_none() {
        return Ok(None);
    }

    let mut tls = ClientTlsConfig::new();

    if let Some(ca_path) = &config.tls_ca {
        let ca_pem = fs::read(ca_path)?;
        tls = tls.ca_certificate(Certificate::from_pem(ca_pem));
    }

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = fs::read(cert_path)?;
            let key_pem = fs::read(key_path)?;
            tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
        }
        (None, None) => {}
        _ => {
            return Err("tls_cert and tls_key must be set together, or neither".into());
        }
    }

    Ok(Some(tls))
}

/// Issues a `Lookup` RPC and decodes the `Response` payload.
pub async fn lookup(
    client: &mut RaftKvClient<Channel>,
    cluster_id: u64,
    query: Query,
) -> Result<Response, ClusterError> {
    let payload = serde_json::to_vec(&LookupRequest { query, response: ResponseField::default() })
        .map_err(|e| ClusterError::Response(e.to_string()))?;

    let resp = client
        .lookup(ClientRequest { cluster_id, payload })
        .await
        .map_err(|e| ClusterError::Response(e.to_string()))?
        .into_inner();

    serde_json::from_slice(&resp.payload).map_err(|e| ClusterError::Response(e.to_string()))
}

/// Issues an `Update` RPC and decodes the `Response` payload.
pub async fn update(
    client: &mut RaftKvClient<Channel>,
    cluster_id: u64,
    request: UpdateRequest,
) -> Result<Response, ClusterError> {
    let payload =
        serde_json::to_vec(&request).map_err(|e| ClusterError::Response(e.to_string()))?;

    let resp = client
        .update(ClientRequest { cluster_id, payload })
        .await
        .map_err(|e| ClusterError::Response(e.to_string()))?
        .into_inner();

    serde_json::from_slice(&resp.payload).map_err(|e| ClusterError::Response(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtls_requires_cert_and_key_together() {
        let config = ClientConfig {
            target_addr: "127.0.0.1:9000".to_string(),
            tls_ca: None,
            tls_cert: Some("cert.pem".to_string()),
            tls_key: None,
        };
        assert!(configure_mtls(&config).is_err());
    }

    #[test]
    fn no_tls_settings_skips_tls_config() {
        let config = ClientConfig {
            target_addr: "127.0.0.1:9000".to_string(),
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
        };
        assert!(configure_mtls(&config).unwrap().is_none());
    }
}
