use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
    SignatureAlgorithm,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

const MAX_SERVER_CONFIG_CACHE: usize = 256;
const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";

/// RSA modulus size at which P-384 matches the requested strength.
const P384_EQUIVALENT_BITS: u32 = 7680;

/// Inputs for the certificate authority, taken verbatim from the session
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertOptions {
    pub certs_dir: PathBuf,
    pub server_key_length: u32,
    pub ca_common_name: String,
}

/// Leaf keys are ECDSA; the configured length is read as an RSA-equivalent
/// strength.
pub fn signature_algorithm_for(key_length: u32) -> &'static SignatureAlgorithm {
    if key_length >= P384_EQUIVALENT_BITS {
        &rcgen::PKCS_ECDSA_P384_SHA384
    } else {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

pub struct CertManager {
    certs_dir: PathBuf,
    pub ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    leaf_algorithm: &'static SignatureAlgorithm,
    server_configs: Mutex<ServerConfigCache>,
}

impl CertManager {
    /// Load the CA from `certs_dir`, generating and persisting one on first use.
    pub fn load_or_create(options: &CertOptions) -> anyhow::Result<Self> {
        let path = options.certs_dir.as_path();
        let ca_cert_path = path.join(CA_CERT_FILE);
        let ca_key_path = path.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_pem) = if ca_cert_path.exists() && ca_key_path.exists() {
            let ca_cert_pem =
                fs::read_to_string(&ca_cert_path).context("Failed to read CA certificate file")?;
            let ca_key_pem =
                fs::read_to_string(&ca_key_path).context("Failed to read CA key file")?;

            let ca_key = KeyPair::from_pem(&ca_key_pem).context("Failed to parse CA key")?;
            let params =
                CertificateParams::from_ca_cert_pem(&ca_cert_pem).context("Invalid CA PEM")?;
            let ca_cert = params
                .self_signed(&ca_key)
                .context("Failed to reconstruct CA certificate")?;

            tracing::debug!("Loaded CA from {}", ca_cert_path.display());
            (ca_cert, ca_key, ca_cert_pem)
        } else {
            let (ca_cert, ca_key) = Self::generate_root(&options.ca_common_name)?;
            let ca_cert_pem = ca_cert.pem();

            write_ca_files(path, &ca_cert_pem, &ca_key.serialize_pem())?;
            tracing::info!(
                "Generated CA '{}' in {}",
                options.ca_common_name,
                path.display()
            );

            (ca_cert, ca_key, ca_cert_pem)
        };

        // Served chains carry the persisted CA bytes; reloading re-signs `ca_cert`.
        let ca_chain = vec![CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
            .map_err(|e| anyhow!("Invalid CA PEM: {e}"))?];

        Ok(Self {
            certs_dir: path.to_path_buf(),
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain,
            leaf_algorithm: signature_algorithm_for(options.server_key_length),
            server_configs: Mutex::new(ServerConfigCache::new()),
        })
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    fn generate_root(common_name: &str) -> anyhow::Result<(Certificate, KeyPair)> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, common_name);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign CA certificate")?;
        Ok((cert, key_pair))
    }

    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        {
            let mut cache = self
                .server_configs
                .lock()
                .map_err(|_| anyhow!("CertManager cache poisoned"))?;
            if let Some(cfg) = cache.get(&cache_key) {
                return Ok(cfg);
            }
        }

        let (cert_chain, key_der) = self.issue_leaf_cert(host)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der)
            .context("Failed to build TLS server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let arc = Arc::new(config);
        let mut cache = self
            .server_configs
            .lock()
            .map_err(|_| anyhow!("CertManager cache poisoned"))?;
        cache.insert(cache_key, arc.clone());
        Ok(arc)
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated an hour for clock skew; kept under the 398 day client limit.
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(397)).unwrap_or(now);

        let key_pair =
            KeyPair::generate_for(self.leaf_algorithm).context("Failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("Failed to sign leaf certificate")?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }

    #[cfg(test)]
    pub fn test_ca_der(&self) -> CertificateDer<'static> {
        self.ca_chain[0].clone()
    }
}

fn write_ca_files(dir: &Path, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).context("Failed to create cert storage directory")?;
    }
    fs::write(dir.join(CA_CERT_FILE), cert_pem).context("Failed to write CA certificate")?;
    fs::write(dir.join(CA_KEY_FILE), key_pem).context("Failed to write CA key")?;
    Ok(())
}

struct ServerConfigCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl ServerConfigCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<ServerConfig>> {
        let cfg = self.map.get(key).cloned()?;
        self.promote(key);
        Some(cfg)
    }

    fn insert(&mut self, key: String, config: Arc<ServerConfig>) {
        self.map.insert(key.clone(), config);
        self.promote(&key);
        self.evict();
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn evict(&mut self) {
        while self.order.len() > MAX_SERVER_CONFIG_CACHE {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options(dir: &Path) -> CertOptions {
        CertOptions {
            certs_dir: dir.to_path_buf(),
            server_key_length: 1024,
            ca_common_name: "Test Proxy CA".into(),
        }
    }

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();

        let first = CertManager::load_or_create(&options(dir.path())).expect("initial creation");
        assert!(!first.ca_cert_pem.is_empty());
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());

        let original_pem = fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap();
        let again = CertManager::load_or_create(&options(dir.path())).expect("reuse existing");
        assert_eq!(again.ca_cert_pem, original_pem);
        assert_eq!(again.test_ca_der(), first.test_ca_der());
    }

    #[test]
    fn leaf_from_reloaded_ca_chains_to_persisted_root() {
        use rustls::client::danger::ServerCertVerifier;
        use rustls::client::WebPkiServerVerifier;
        use rustls::pki_types::{ServerName, UnixTime};

        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempdir().unwrap();
        let first = CertManager::load_or_create(&options(dir.path())).unwrap();
        let persisted_root = first.test_ca_der();
        drop(first);

        let reloaded = CertManager::load_or_create(&options(dir.path())).unwrap();
        let (chain, _key) = reloaded.issue_leaf_cert("reload.test").unwrap();
        assert_eq!(chain[1], persisted_root);

        let mut roots = rustls::RootCertStore::empty();
        roots.add(persisted_root).unwrap();
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap();
        verifier
            .verify_server_cert(
                &chain[0],
                &chain[1..],
                &ServerName::try_from("reload.test").unwrap(),
                &[],
                UnixTime::now(),
            )
            .expect("leaf chains to the CA on disk");
    }

    #[test]
    fn unreadable_ca_material_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CA_CERT_FILE), "garbage").unwrap();
        fs::write(dir.path().join(CA_KEY_FILE), "garbage").unwrap();

        assert!(CertManager::load_or_create(&options(dir.path())).is_err());
    }

    #[test]
    fn key_length_selects_curve() {
        assert_eq!(signature_algorithm_for(1024), &rcgen::PKCS_ECDSA_P256_SHA256);
        assert_eq!(signature_algorithm_for(4096), &rcgen::PKCS_ECDSA_P256_SHA256);
        assert_eq!(signature_algorithm_for(8192), &rcgen::PKCS_ECDSA_P384_SHA384);
    }

    #[test]
    fn server_configs_are_cached_per_host() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempdir().unwrap();
        let manager = CertManager::load_or_create(&options(dir.path())).unwrap();

        let a = manager.server_config_for_host("Example.COM").unwrap();
        let b = manager.server_config_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        manager.server_config_for_host("127.0.0.1").unwrap();
        assert_eq!(manager.server_configs.lock().unwrap().len(), 2);
    }
}
