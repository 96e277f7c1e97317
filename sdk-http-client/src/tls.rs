use crate::config::TlsConfig;
use rustls::crypto::ring::default_provider;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use rustls_native_certs::load_native_certs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const CERT_EXTENSION: &str = "pem";

/// Protocol versions the client is allowed to negotiate.
pub static ENABLED_PROTOCOLS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

#[derive(thiserror::Error, Debug)]
pub enum TlsContextError {
    #[error("error building tls context: `{0}`")]
    BuildingError(String),
    #[error("IO error: `{0}`")]
    IOError(String),
}

/// Immutable TLS client configuration shared by the https socket factory and the transport.
/// Server certificates are always verified against the trust store, hostname included.
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn client_config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Builds the TLS context out of the system defaults (native root certificates) plus the certificates in the
/// configured CA bundle file and directory, restricted to [ENABLED_PROTOCOLS].
/// It returns an error if there are issues reading the provided paths or if invalid certificates are found.
pub fn build_tls_context(config: &TlsConfig) -> Result<TlsContext, TlsContextError> {
    let mut root_store = root_store_with_native_certs();

    if let Some(pem_file) = config.ca_bundle_file() {
        add_certs_from_file(&mut root_store, pem_file)?;
    }
    if let Some(pem_files_dir) = config.ca_bundle_dir() {
        add_certs_from_dir(&mut root_store, pem_files_dir)?;
    }

    let client_config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_protocol_versions(ENABLED_PROTOCOLS)
        .map_err(|e| {
            TlsContextError::BuildingError(format!("unsupported protocol versions: {e}"))
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsContext {
        config: Arc::new(client_config),
    })
}

fn root_store_with_native_certs() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    let native = load_native_certs();
    for err in native.errors.iter() {
        warn!("could not load some system certificates: {err}");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    debug!(added, ignored, "system certificates loaded");
    root_store
}

fn add_certs_from_dir(
    root_store: &mut RootCertStore,
    pem_files_dir: &Path,
) -> Result<(), TlsContextError> {
    let dir_entries = std::fs::read_dir(pem_files_dir).map_err(|e| {
        TlsContextError::BuildingError(format!(
            "cannot read directory {}: {}",
            pem_files_dir.to_string_lossy(),
            e
        ))
    })?;
    for dir_entry in dir_entries {
        let file_path = dir_entry
            .map_err(|err| {
                TlsContextError::IOError(format!(
                    "error reading directory {}: {}",
                    pem_files_dir.to_string_lossy(),
                    err
                ))
            })?
            .path();
        if path_has_cert_extension(&file_path) {
            add_certs_from_file(root_store, &file_path)?;
        }
    }
    Ok(())
}

fn path_has_cert_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension == CERT_EXTENSION)
}

/// Adds the certificates in the provided PEM file. Errors if the file cannot be read or a certificate is invalid.
fn add_certs_from_file(
    root_store: &mut RootCertStore,
    pem_path: &Path,
) -> Result<(), TlsContextError> {
    let mut pem = std::io::BufReader::new(std::fs::File::open(pem_path).map_err(|e| {
        TlsContextError::BuildingError(format!(
            "cannot read custom certificate {}: {}",
            pem_path.to_string_lossy(),
            e
        ))
    })?);
    for cert_result in rustls_pemfile::certs(&mut pem) {
        let cert = cert_result.map_err(|err| {
            TlsContextError::BuildingError(format!(
                "invalid custom certificate {}: {}",
                pem_path.to_string_lossy(),
                err,
            ))
        })?;
        root_store.add(cert).map_err(|e| {
            TlsContextError::BuildingError(format!(
                "cannot add custom certificate {}: {}",
                pem_path.to_string_lossy(),
                e
            ))
        })?;
    }
    Ok(())
}
