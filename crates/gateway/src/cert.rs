//! C1 Cert Authority: an on-disk root CA plus per-domain leaf certs for the
//! MITM proxy (§3, §4.1). Grounded in `rcgen`'s `Issuer::from_ca_cert_pem`
//! pattern, hand-rolled rather than delegated to a framework, since §4.1
//! specifies byte-level CONNECT handling a framework would hide.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, Issuer, IsCa, KeyPair};
use rustls_pki_types::PrivateKeyDer;

/// §5 resource policy: cache at most 50 leaf TLS contexts; clear the whole
/// cache on overflow rather than tracking precise LRU order.
const MAX_CACHED_LEAVES: usize = 50;

/// Installs the process-wide rustls crypto provider. Idempotent: a second
/// call (e.g. from tests) is a harmless no-op.
pub fn install_crypto_provider() {
	let _ = rustls::crypto::ring::default_provider().install_default();
}

pub struct CertAuthority {
	issuer: Issuer<'static, KeyPair>,
	leaves: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl CertAuthority {
	/// Loads the root key+cert from `store_dir`, generating and persisting a
	/// fresh pair on first run (§3: "one root key+cert ... leaves are cached
	/// between runs").
	pub fn load_or_generate(store_dir: &Path) -> anyhow::Result<Self> {
		std::fs::create_dir_all(store_dir)?;
		let cert_path = store_dir.join("root-cert.pem");
		let key_path = store_dir.join("root-key.pem");

		let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
			(
				std::fs::read_to_string(&cert_path)?,
				std::fs::read_to_string(&key_path)?,
			)
		} else {
			let key_pair = KeyPair::generate()?;
			let mut params = CertificateParams::new(Vec::<String>::new())?;
			params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
			let mut dn = DistinguishedName::new();
			dn.push(DnType::CommonName, "Studio Bridge Root CA");
			params.distinguished_name = dn;
			let cert = params.self_signed(&key_pair)?;
			let cert_pem = cert.pem();
			let key_pem = key_pair.serialize_pem();
			std::fs::write(&cert_path, &cert_pem)?;
			std::fs::write(&key_path, &key_pem)?;
			(cert_pem, key_pem)
		};

		let key_pair = KeyPair::from_pem(&key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
		Ok(CertAuthority {
			issuer,
			leaves: Mutex::new(HashMap::new()),
		})
	}

	/// Returns a leaf TLS server config for `host`, minting and caching one on
	/// miss (§4.1 step 2).
	pub fn server_config_for(&self, host: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
		let mut leaves = self.leaves.lock().expect("leaf cache poisoned");
		if let Some(cfg) = leaves.get(host) {
			return Ok(cfg.clone());
		}
		if leaves.len() >= MAX_CACHED_LEAVES {
			leaves.clear();
		}

		let leaf_key = KeyPair::generate()?;
		let mut params = CertificateParams::new(vec![host.to_string()])?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, host);
		params.distinguished_name = dn;
		let leaf_cert = params.signed_by(&leaf_key, &self.issuer)?;

		let cert_der = leaf_cert.der().clone();
		let key_der = PrivateKeyDer::Pkcs8(leaf_key.serialize_der().into());
		let mut server_cfg = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(vec![cert_der], key_der)?;
		server_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
		let server_cfg = Arc::new(server_cfg);
		leaves.insert(host.to_string(), server_cfg.clone());
		Ok(server_cfg)
	}

	pub fn cached_leaf_count(&self) -> usize {
		self.leaves.lock().expect("leaf cache poisoned").len()
	}
}

pub fn default_store_dir() -> PathBuf {
	PathBuf::from("./certs")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_and_reuses_root() {
		install_crypto_provider();
		let dir = tempfile::tempdir().unwrap();
		let ca1 = CertAuthority::load_or_generate(dir.path()).unwrap();
		let cfg1 = ca1.server_config_for("foo.example.com").unwrap();
		// Reloading from the same directory must reuse the persisted root.
		let ca2 = CertAuthority::load_or_generate(dir.path()).unwrap();
		let cfg2 = ca2.server_config_for("foo.example.com").unwrap();
		assert!(!Arc::ptr_eq(&cfg1, &cfg2)); // different process instances, not cached across
	}

	#[test]
	fn leaf_cache_is_reused_within_one_authority() {
		install_crypto_provider();
		let dir = tempfile::tempdir().unwrap();
		let ca = CertAuthority::load_or_generate(dir.path()).unwrap();
		let a = ca.server_config_for("bar.example.com").unwrap();
		let b = ca.server_config_for("bar.example.com").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(ca.cached_leaf_count(), 1);
	}

	#[test]
	fn leaf_cache_clears_on_overflow() {
		install_crypto_provider();
		let dir = tempfile::tempdir().unwrap();
		let ca = CertAuthority::load_or_generate(dir.path()).unwrap();
		for i in 0..MAX_CACHED_LEAVES {
			ca.server_config_for(&format!("host{i}.example.com")).unwrap();
		}
		assert_eq!(ca.cached_leaf_count(), MAX_CACHED_LEAVES);
		ca.server_config_for("overflow.example.com").unwrap();
		assert_eq!(ca.cached_leaf_count(), 1);
	}
}
