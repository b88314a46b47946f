use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use sha1::{Digest, Sha1};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;

use crate::files::{io_error, lock_exclusive, read_to_string, write_exclusive};
use crate::{Error, Result, RootFiles};

const KEY_BITS: usize = 2048;
const ROOT_VALIDITY: Duration = Duration::days(36_525);
/// Two years and thirty days.
const LEAF_VALIDITY: Duration = Duration::days(2 * 365 + 30);

const ROOT_COMMON_NAME: &str = "Kana Development CA";

/// The loaded root certificate authority.
pub struct RootCa {
    key: RsaPrivateKey,
    cert_pem: String,
    cert_der: Vec<u8>,
}

/// A freshly issued leaf certificate.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
}

fn key_error(e: impl std::fmt::Display) -> Error {
    Error::Key(e.to_string())
}

fn parse_error(e: impl std::fmt::Display) -> Error {
    Error::Parse(e.to_string())
}

fn generate_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand_core::OsRng, KEY_BITS).map_err(key_error)
}

/// The same key in the form rcgen signs with.
fn signing_key(key: &RsaPrivateKey) -> Result<KeyPair> {
    let pem = key.to_pkcs8_pem(LineEnding::LF).map_err(key_error)?;
    Ok(KeyPair::from_pem(&pem)?)
}

/// SHA-1 over the encoded RSA public key, as used for SKID and AKID.
fn key_identifier(key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let public = key.to_public_key().to_pkcs1_der().map_err(key_error)?;
    Ok(Sha1::digest(public.as_bytes()).to_vec())
}

/// Uniform over the positive 63-bit range.
fn serial_number() -> SerialNumber {
    SerialNumber::from(rand::rng().random_range(1..=i64::MAX as u64))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let (_, pem) = parse_x509_pem(pem.as_bytes()).map_err(parse_error)?;
    Ok(pem.contents)
}

/// Load the root CA from `files`, creating it if it does not exist yet.
///
/// Creation happens under an exclusive lock next to the files, so concurrent
/// callers all end up with the pair the first one wrote. When exactly one of
/// the two files is present the orphan is deleted and a new pair is
/// generated. A key that does not match its certificate is
/// [`Error::CorruptCertificateAuthority`] and is never replaced silently.
pub fn load_or_create_root(files: &RootFiles) -> Result<RootCa> {
    std::fs::create_dir_all(&files.dir).map_err(io_error(&files.dir))?;
    let _lock = lock_exclusive(&files.lock_path())?;

    let cert_path = files.cert_path();
    let key_path = files.key_path();

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => return RootCa::load(files),
        (false, false) => {}
        (cert_present, _) => {
            let orphan = if cert_present { &cert_path } else { &key_path };
            warn!(path = %orphan.display(), "certs: removing orphaned root CA file");
            std::fs::remove_file(orphan).map_err(io_error(orphan))?;
        }
    }

    let root = RootCa::generate()?;
    root.persist(&cert_path, &key_path)?;
    info!(cert = %cert_path.display(), "certs: root CA created");
    Ok(root)
}

/// Load the root CA without ever creating one. `None` unless both files are
/// present.
pub fn load_root(files: &RootFiles) -> Result<Option<RootCa>> {
    if !files.dir.is_dir() {
        return Ok(None);
    }
    let _lock = lock_exclusive(&files.lock_path())?;
    if files.cert_path().exists() && files.key_path().exists() {
        RootCa::load(files).map(Some)
    } else {
        Ok(None)
    }
}

impl RootCa {
    fn generate() -> Result<Self> {
        let key = generate_key()?;
        let now = OffsetDateTime::now_utc();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, "US");
        dn.push(DnType::StateOrProvinceName, "Florida");
        dn.push(DnType::LocalityName, "Sarasota");
        dn.push(DnType::OrganizationName, "Kana");
        dn.push(DnType::OrganizationalUnitName, "Development");
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(serial_number());
        params.not_before = now;
        params.not_after = now + ROOT_VALIDITY;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.key_identifier_method = KeyIdMethod::PreSpecified(key_identifier(&key)?);
        params.use_authority_key_identifier_extension = true;

        let cert = params.self_signed(&signing_key(&key)?)?;
        Ok(Self {
            key,
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
        })
    }

    fn load(files: &RootFiles) -> Result<Self> {
        let cert_path = files.cert_path();
        let key_path = files.key_path();

        let key_pem = read_to_string(&key_path)?;
        let key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
            .map_err(|e| Error::Key(format!("{}: {e}", key_path.display())))?;
        let cert_pem = read_to_string(&cert_path)?;
        let cert_der = pem_to_der(&cert_pem)?;

        let root = Self {
            key,
            cert_pem,
            cert_der,
        };
        if !root.key_matches_cert()? {
            return Err(Error::CorruptCertificateAuthority {
                cert: cert_path,
                key: key_path,
            });
        }

        debug!(cert = %cert_path.display(), "certs: root CA loaded");
        Ok(root)
    }

    fn key_matches_cert(&self) -> Result<bool> {
        let (_, cert) = parse_x509_certificate(&self.cert_der).map_err(parse_error)?;
        let public = self.key.to_public_key().to_pkcs1_der().map_err(key_error)?;
        Ok(cert.public_key().subject_public_key.data.as_ref() == public.as_bytes())
    }

    /// Key first, certificate second, both exclusively created.
    fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let key_pem = self.key.to_pkcs1_pem(LineEnding::LF).map_err(key_error)?;
        write_exclusive(key_path, key_pem.as_bytes()).map_err(io_error(key_path))?;
        write_exclusive(cert_path, self.cert_pem.as_bytes()).map_err(io_error(cert_path))
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issue a wildcard certificate for `*.domain` into `dir`.
    ///
    /// Never overwrites: if either target file exists this fails with
    /// [`Error::LeafExists`].
    pub fn issue_leaf(&self, domain: &str, dir: &Path, cert_name: &str, key_name: &str) -> Result<Leaf> {
        let cert_path = dir.join(cert_name);
        let key_path = dir.join(key_name);
        for path in [&cert_path, &key_path] {
            if path.exists() {
                return Err(Error::LeafExists(path.clone()));
            }
        }
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;

        let wildcard = format!("*.{domain}");
        let leaf_key = generate_key()?;
        let now = OffsetDateTime::now_utc();

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, wildcard.as_str());
        params.subject_alt_names = vec![SanType::DnsName(wildcard.clone().try_into()?)];
        params.serial_number = Some(serial_number());
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let ca_key = signing_key(&self.key)?;
        let issuer = CertificateParams::from_ca_cert_pem(&self.cert_pem)?.self_signed(&ca_key)?;
        let cert = params.signed_by(&signing_key(&leaf_key)?, &issuer, &ca_key)?;

        let cert_pem = cert.pem();
        let key_pem = leaf_key.to_pkcs1_pem(LineEnding::LF).map_err(key_error)?;
        let exclusive = |path: &Path, contents: &[u8]| {
            write_exclusive(path, contents).map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::LeafExists(path.to_path_buf()),
                _ => Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                },
            })
        };
        exclusive(&key_path, key_pem.as_bytes())?;
        exclusive(&cert_path, cert_pem.as_bytes())?;

        info!(domain = %wildcard, cert = %cert_path.display(), "certs: leaf certificate issued");
        Ok(Leaf {
            cert_path,
            key_path,
            cert_pem,
        })
    }

    /// Check that a PEM leaf certificate was signed by this root.
    pub fn verify_leaf(&self, pem: &str) -> Result<()> {
        self.verify_leaf_der(&pem_to_der(pem)?)
    }

    pub fn verify_leaf_der(&self, der: &[u8]) -> Result<()> {
        let (_, root) = parse_x509_certificate(&self.cert_der).map_err(parse_error)?;
        let (_, leaf) = parse_x509_certificate(der).map_err(parse_error)?;
        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| Error::Verify(e.to_string()))
    }
}
