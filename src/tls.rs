//! TLS context construction.
//!
//! Server material comes from a certificate directory with fixed file names
//! (`ssl_crt.pem`, `ssl_key.pem`, `ssl_dh.pem`, optional `ssl_crt.pwd`) or
//! from explicit paths. The client context for chained upstreams trusts the
//! bundled webpki roots plus any configured local certificate.
//!
//! rustls exposes no DH-parameter or OpenSSL-cipher-string hooks; those
//! options are accepted and logged but do not change suite selection. The
//! protocol floor is TLS 1.2.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::error::{Error, Result};
use crate::server::config::TlsOptions;

const CERT_FILE: &str = "ssl_crt.pem";
const KEY_FILE: &str = "ssl_key.pem";
const DH_FILE: &str = "ssl_dh.pem";
const PASSWD_FILE: &str = "ssl_crt.pwd";

struct Material {
    certificate: PathBuf,
    key: PathBuf,
    passwd: Option<String>,
    dhparam: Option<PathBuf>,
}

fn resolve_material(tls: &TlsOptions) -> Option<Material> {
    if let Some(dir) = &tls.cert_dir {
        let passwd_path = dir.join(PASSWD_FILE);
        let passwd = passwd_path
            .exists()
            .then(|| passwd_path.to_string_lossy().into_owned());
        return Some(Material {
            certificate: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            passwd,
            dhparam: Some(dir.join(DH_FILE)),
        });
    }

    match (&tls.certificate, &tls.certificate_key) {
        (Some(cert), Some(key)) => Some(Material {
            certificate: cert.clone(),
            key: key.clone(),
            passwd: tls.certificate_passwd.clone(),
            dhparam: tls.dhparam.clone(),
        }),
        _ => None,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("open certificate {}: {e}", path.display())))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| Error::tls(format!("parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path, passwd: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).map_err(|e| Error::tls(format!("open key {}: {e}", path.display())))?;

    match rustls_pemfile::private_key(&mut BufReader::new(file)) {
        Ok(Some(key)) => {
            if passwd.is_some() {
                tracing::warn!("private key is not encrypted, ignoring configured passphrase");
            }
            Ok(key)
        }
        Ok(None) | Err(_) if passwd.is_some() => Err(Error::tls(format!(
            "key {} appears encrypted; passphrase-protected keys are not supported, \
             decrypt it first (openssl pkey -in ... -out ...)",
            path.display()
        ))),
        Ok(None) => Err(Error::tls(format!("no private key in {}", path.display()))),
        Err(e) => Err(Error::tls(format!("parse key: {e}"))),
    }
}

/// Build the inbound TLS acceptor configuration, or `None` when no server
/// material is configured.
pub fn server_config(tls: &TlsOptions) -> Result<Option<Arc<rustls::ServerConfig>>> {
    let Some(material) = resolve_material(tls) else {
        return Ok(None);
    };

    let certs = load_certs(&material.certificate)?;

    // Passphrase may be given directly or as a file path.
    let passwd = material.passwd.as_deref().map(|spec| {
        std::fs::read_to_string(spec)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| spec.to_string())
    });
    let key = load_key(&material.key, passwd.as_deref())?;

    if let Some(dh) = &material.dhparam {
        if dh.exists() {
            tracing::debug!(
                "dhparam {} ignored: key exchange is ECDHE under rustls",
                dh.display()
            );
        }
    }
    if let Some(ciphers) = &tls.ciphers {
        tracing::debug!("cipher preference `{ciphers}` recorded; rustls selects its own suites");
    }
    if tls.prefer_server_ciphers {
        tracing::debug!("prefer_server_ciphers recorded; rustls orders suites server-side");
    }

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::tls(format!("server config: {e}")))?;

    Ok(Some(Arc::new(config)))
}

/// Build the outbound TLS configuration used when chaining with TLS.
pub fn client_config(tls: &TlsOptions) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    // Deployments chaining to a server using the same local material can
    // trust it directly.
    if let Some(material) = resolve_material(tls) {
        if material.certificate.exists() {
            if let Ok(certs) = load_certs(&material.certificate) {
                for cert in certs {
                    let _ = roots.add(cert);
                }
            }
        }
    }

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::new(config))
}
