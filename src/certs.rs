//! Certificate store for TLS termination
//! Loads one credential per domain from a certbot-style directory layout
//! and resolves certificates per connection via SNI

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Well-known filenames inside each certificate directory (certbot layout).
const KEY_FILENAME: &str = "privkey.pem";
const CHAIN_FILENAME: &str = "fullchain.pem";

/// Errors from certificate loading
#[derive(Debug, Error)]
pub enum CertError {
    /// The certificate root itself is unreadable. Fatal at startup.
    #[error("failed to read certificate root {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One domain's key or chain is missing or malformed. That domain is
    /// skipped; the rest of the store still loads.
    #[error("invalid credential in {path}: {reason}")]
    Credential { path: PathBuf, reason: String },
}

/// One domain's TLS material, with the rustls signing context built
/// eagerly at load time so a handshake costs only a map lookup
pub struct Credential {
    certified: Arc<CertifiedKey>,
}

impl Credential {
    fn load(dir: &Path) -> Result<Self, CertError> {
        let chain = load_chain(&dir.join(CHAIN_FILENAME))
            .map_err(|reason| CertError::Credential {
                path: dir.to_path_buf(),
                reason,
            })?;
        let key = load_private_key(&dir.join(KEY_FILENAME))
            .map_err(|reason| CertError::Credential {
                path: dir.to_path_buf(),
                reason,
            })?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertError::Credential {
                path: dir.to_path_buf(),
                reason: format!("unsupported private key: {}", e),
            })?;

        Ok(Self {
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// The derived TLS context presented during handshakes
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }
}

/// Read-only domain -> credential map, built once before the listeners start
pub struct CertStore {
    credentials: HashMap<String, Arc<Credential>>,
    default_domain: Option<String>,
}

impl CertStore {
    /// Load every credential under `certs_root`. Each immediate
    /// subdirectory is one certificate lineage; its domain is the directory
    /// name truncated at the certbot renewal suffix (`example.com-0001` ->
    /// `example.com`). Directories are read in lexicographic order so a
    /// renewed lineage deterministically wins over the original.
    ///
    /// A broken subdirectory is reported and skipped; only an unreadable
    /// root aborts the load.
    pub fn load<P: AsRef<Path>>(
        certs_root: P,
        default_domain: Option<String>,
    ) -> Result<Self, CertError> {
        let root = certs_root.as_ref();
        let entries = std::fs::read_dir(root).map_err(|e| CertError::Load {
            path: root.to_path_buf(),
            source: e,
        })?;

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut credentials = HashMap::new();

        for dir in &dirs {
            let name = match dir.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let domain = domain_from_dir_name(name);

            match Credential::load(dir) {
                Ok(cred) => {
                    info!("Loaded certificate for {} from {}", domain, dir.display());
                    credentials.insert(domain.to_string(), Arc::new(cred));
                }
                Err(e) => {
                    warn!("Skipping certificate directory: {}", e);
                }
            }
        }

        if let Some(ref d) = default_domain {
            if !credentials.contains_key(d) {
                warn!("Default domain {} has no loaded certificate", d);
            }
        }

        Ok(Self {
            credentials,
            default_domain,
        })
    }

    /// Look up the credential for a domain
    pub fn lookup(&self, domain: &str) -> Option<Arc<Credential>> {
        self.credentials.get(domain).cloned()
    }

    /// Number of loaded domains
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn default_credential(&self) -> Option<Arc<Credential>> {
        self.default_domain.as_deref().and_then(|d| self.lookup(d))
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("domains", &self.credentials.keys().collect::<Vec<_>>())
            .field("default_domain", &self.default_domain)
            .finish()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let cred = match client_hello.server_name() {
            Some(name) => self.lookup(name).or_else(|| {
                warn!("No certificate for SNI name {}", name);
                self.default_credential()
            }),
            None => {
                warn!("TLS client sent no SNI");
                self.default_credential()
            }
        };

        cred.map(|c| c.certified_key())
    }
}

/// Derive a domain from a certificate directory name by truncating at the
/// renewal-suffix marker
fn domain_from_dir_name(name: &str) -> &str {
    match name.split_once("-0") {
        Some((domain, _)) => domain,
        None => name,
    }
}

fn load_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?;

    if chain.is_empty() {
        return Err(format!("no certificates in {}", path.display()));
    }

    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?
        .ok_or_else(|| format!("no private key in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_cert_dir(root: &Path, dir_name: &str, domain: &str) {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CHAIN_FILENAME), cert.serialize_pem().unwrap()).unwrap();
        fs::write(dir.join(KEY_FILENAME), cert.serialize_private_key_pem()).unwrap();
    }

    #[test]
    fn test_domain_from_dir_name() {
        assert_eq!(domain_from_dir_name("example.com"), "example.com");
        assert_eq!(domain_from_dir_name("example.com-0001"), "example.com");
        assert_eq!(domain_from_dir_name("example.com-0012"), "example.com");
    }

    #[test]
    fn test_load_and_lookup() {
        let root = tempdir().unwrap();
        write_cert_dir(root.path(), "a.com", "a.com");
        write_cert_dir(root.path(), "b.com-0001", "b.com");

        let store = CertStore::load(root.path(), None).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.lookup("a.com").is_some());
        assert!(store.lookup("b.com").is_some());
        assert!(store.lookup("c.com").is_none());
    }

    #[test]
    fn test_distinct_credentials_per_domain() {
        let root = tempdir().unwrap();
        write_cert_dir(root.path(), "a.com", "a.com");
        write_cert_dir(root.path(), "b.com", "b.com");

        let store = CertStore::load(root.path(), None).unwrap();

        let a = store.lookup("a.com").unwrap();
        let b = store.lookup("b.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_renewal_lineages_collapse_to_one_domain() {
        let root = tempdir().unwrap();
        write_cert_dir(root.path(), "a.com", "a.com");
        write_cert_dir(root.path(), "a.com-0001", "a.com");

        let store = CertStore::load(root.path(), None).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.lookup("a.com").is_some());
    }

    #[test]
    fn test_broken_directory_is_skipped() {
        let root = tempdir().unwrap();
        write_cert_dir(root.path(), "a.com", "a.com");
        // Directory with no key or chain files
        fs::create_dir_all(root.path().join("broken.com")).unwrap();

        let store = CertStore::load(root.path(), None).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.lookup("a.com").is_some());
        assert!(store.lookup("broken.com").is_none());
    }

    #[test]
    fn test_unreadable_root_is_fatal() {
        let root = tempdir().unwrap();
        let missing = root.path().join("does-not-exist");

        let result = CertStore::load(&missing, None);
        assert!(matches!(result, Err(CertError::Load { .. })));
    }
}
