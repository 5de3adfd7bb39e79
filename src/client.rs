//! HTTP client construction, the non-per-request half of the transfer
//! engine adapter (C6): TLS verification, mTLS identity, DNS override,
//! default headers and connection-pool tuning, all applied once per batch.
//!
//! Grounded in the teacher's original client builder; behavior is carried
//! over essentially unchanged since curl-loader's `SSL_CIPHERS`/
//! `SSL_CERT`/`SSL_KEY` and proxy/header configuration map directly onto
//! reqwest's client builder knobs.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::{info, warn};

use crate::connection_pool::PoolConfig;
use crate::errors::LoaderError;
use crate::utils::parse_headers_with_escapes;

/// Configuration for building the HTTP client.
#[derive(Clone)]
pub struct ClientConfig {
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub custom_headers: Option<String>,
    pub pool_config: Option<PoolConfig>,
}

/// Result of building the client, includes parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(config: &ClientConfig) -> Result<ClientBuildResult, LoaderError> {
    build_client_from(reqwest::Client::builder(), config)
}

/// Like [`build_client`] but binds outbound connections to `source_ip`,
/// so a client with its own source address (§4.9's address planner) gets
/// its own `reqwest::Client` rather than sharing the batch default.
pub fn build_client_bound_to(config: &ClientConfig, source_ip: std::net::IpAddr) -> Result<ClientBuildResult, LoaderError> {
    build_client_from(reqwest::Client::builder().local_address(Some(source_ip)), config)
}

fn build_client_from(mut client_builder: reqwest::ClientBuilder, config: &ClientConfig) -> Result<ClientBuildResult, LoaderError> {
    if let Some(ref resolve_str) = config.resolve_target_addr {
        if !resolve_str.is_empty() {
            client_builder = configure_dns_override(client_builder, resolve_str)?;
        } else {
            info!("resolve_target_addr is set but empty, no DNS override will be applied");
        }
    }

    client_builder = configure_mtls(
        client_builder,
        config.client_cert_path.as_deref(),
        config.client_key_path.as_deref(),
    )?;

    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
        info!("configured custom default headers");
    }

    let pool_config = config.pool_config.clone().unwrap_or_default();
    client_builder = pool_config.apply_to_builder(client_builder);
    info!(
        max_idle_per_host = pool_config.max_idle_per_host,
        idle_timeout = ?pool_config.idle_timeout,
        "connection pool configured"
    );

    let client = if config.skip_tls_verify {
        warn!("skipping TLS certificate verification");
        client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| LoaderError::Configuration(format!("failed to build HTTP client: {e}")))?
    } else {
        client_builder
            .build()
            .map_err(|e| LoaderError::Configuration(format!("failed to build HTTP client: {e}")))?
    };

    Ok(ClientBuildResult { client, parsed_headers })
}

fn configure_dns_override(
    mut client_builder: reqwest::ClientBuilder,
    resolve_str: &str,
) -> Result<reqwest::ClientBuilder, LoaderError> {
    info!(resolve_str, "applying DNS override");

    let parts: Vec<&str> = resolve_str.split(':').collect();
    if parts.len() != 3 {
        return Err(LoaderError::Configuration(format!(
            "resolve_target_addr '{resolve_str}' is not in the expected format 'hostname:ip:port'"
        )));
    }

    let hostname_to_override = parts[0].trim();
    let ip_to_resolve_to = parts[1].trim();
    let port_to_connect_to_str = parts[2].trim();

    if hostname_to_override.is_empty() || ip_to_resolve_to.is_empty() || port_to_connect_to_str.is_empty() {
        return Err(LoaderError::Configuration(
            "resolve_target_addr: hostname, ip and port parts must all be non-empty".into(),
        ));
    }

    let port_to_connect_to: u16 = port_to_connect_to_str
        .parse()
        .map_err(|e| LoaderError::Configuration(format!("invalid port '{port_to_connect_to_str}' in resolve_target_addr: {e}")))?;

    let socket_addr_str = format!("{ip_to_resolve_to}:{port_to_connect_to}");
    let socket_addr: SocketAddr = socket_addr_str
        .parse()
        .map_err(|e| LoaderError::Configuration(format!("invalid resolve_target_addr '{socket_addr_str}': {e}")))?;

    client_builder = client_builder.resolve(hostname_to_override, socket_addr);
    info!(hostname_to_override, %socket_addr, "DNS override configured");

    Ok(client_builder)
}

fn configure_mtls(
    mut client_builder: reqwest::ClientBuilder,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<reqwest::ClientBuilder, LoaderError> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!(cert_path, key_path, "loading mTLS client identity");

            let mut cert_pem_buf = Vec::new();
            File::open(cert_path)
                .and_then(|mut f| f.read_to_end(&mut cert_pem_buf))
                .map_err(|e| LoaderError::Configuration(format!("failed to read client cert '{cert_path}': {e}")))?;

            let mut key_pem_buf = Vec::new();
            File::open(key_path)
                .and_then(|mut f| f.read_to_end(&mut key_pem_buf))
                .map_err(|e| LoaderError::Configuration(format!("failed to read client key '{key_path}': {e}")))?;

            let mut cert_pem_cursor = std::io::Cursor::new(cert_pem_buf.as_slice());
            let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem_cursor).collect();
            if certs.is_empty() || certs.iter().any(|c| c.is_err()) {
                return Err(LoaderError::Configuration(format!("no valid PEM certificates found in '{cert_path}'")));
            }

            let mut key_pem_cursor = std::io::Cursor::new(key_pem_buf.as_slice());
            let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem_cursor).collect();
            if keys.is_empty() || keys.iter().any(|k| k.is_err()) {
                return Err(LoaderError::Configuration(format!(
                    "no valid PKCS#8 private key found in '{key_path}'"
                )));
            }

            let mut combined_pem_buf = Vec::new();
            combined_pem_buf.extend_from_slice(&cert_pem_buf);
            if !cert_pem_buf.ends_with(b"\n") && !key_pem_buf.starts_with(b"\n") {
                combined_pem_buf.push(b'\n');
            }
            combined_pem_buf.extend_from_slice(&key_pem_buf);

            let identity = reqwest::Identity::from_pem(&combined_pem_buf)
                .map_err(|e| LoaderError::Configuration(format!("failed to build client identity: {e}")))?;

            client_builder = client_builder.identity(identity);
            info!("mTLS client identity configured");
        }
        (Some(_), None) => {
            return Err(LoaderError::Configuration(
                "client_cert_path is set but client_key_path is missing for mTLS".into(),
            ));
        }
        (None, Some(_)) => {
            return Err(LoaderError::Configuration(
                "client_key_path is set but client_cert_path is missing for mTLS".into(),
            ));
        }
        (None, None) => {}
    }

    Ok(client_builder)
}

fn configure_custom_headers(custom_headers_str: Option<&str>) -> Result<HeaderMap, LoaderError> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let trimmed = header_pair_str.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parts: Vec<&str> = trimmed.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(LoaderError::Configuration(format!(
                "invalid header format in custom_headers: '{trimmed}', expected 'Name:Value'"
            )));
        }

        let name_str = parts[0].trim();
        let value_str = parts[1].trim();
        if name_str.is_empty() {
            return Err(LoaderError::Configuration(format!(
                "header name cannot be empty in '{trimmed}'"
            )));
        }

        let unescaped_value = value_str.replace("\\,", ",");
        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| LoaderError::Configuration(format!("invalid header name '{name_str}': {e}")))?;
        let header_value = HeaderValue::from_str(&unescaped_value)
            .map_err(|e| LoaderError::Configuration(format!("invalid header value for '{name_str}': {e}")))?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_headers_parse_name_value_pairs() {
        let headers = configure_custom_headers(Some("X-Foo:bar,X-Baz:qux")).unwrap();
        assert_eq!(headers.get("x-foo").unwrap(), "bar");
        assert_eq!(headers.get("x-baz").unwrap(), "qux");
    }

    #[test]
    fn dns_override_rejects_malformed_triplet() {
        let builder = reqwest::Client::builder();
        assert!(configure_dns_override(builder, "onlyonepart").is_err());
    }

    #[test]
    fn mtls_requires_both_cert_and_key() {
        let builder = reqwest::Client::builder();
        assert!(configure_mtls(builder, Some("cert.pem"), None).is_err());
    }
}
