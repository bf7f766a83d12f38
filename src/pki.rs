//! Trust material: certificate authorities, the leaf certificates they issue, and the
//! service-account signing keys.
//!
//! Root material is persisted as PEM files in the local configuration directory, and the presence
//! of those files is the only signal for "create or reuse". Re-running `init` against the same
//! directory must reuse the same roots, or every certificate already deployed would stop
//! verifying. Leaf certificates are never persisted here; callers push them to machines.

use crate::error::Error;
use crate::topology::Node;
use anyhow::Context;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Mode of certificate files, locally and on machines.
pub const CERT_FILE_MODE: u32 = 0o644;

/// Mode of private key files, locally and on machines.
pub const KEY_FILE_MODE: u32 = 0o600;

/// Subject organization of every root Helix creates.
pub const ORGANIZATION: &str = "Helix";

const CA_VALIDITY: Duration = Duration::days(3650);
const LEAF_VALIDITY: Duration = Duration::days(30);

/// A certificate and its private key, both PEM encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A root signing identity.
///
/// Read-only once loaded. Every issuance parses the key afresh, so a single authority can be
/// shared by concurrent tasks.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    common_name: String,
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Loads the authority stored at `cert_path` and `key_path`, or creates and stores a new one
    /// if neither file exists.
    ///
    /// # Errors
    ///
    /// Returns [Error::Certificate] if only one of the two files exists or the stored material
    /// doesn't parse. Any other read error is returned as is. Neither case falls back to
    /// generating a new root.
    pub fn load_or_create(
        common_name: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
        match (read_optional(cert_path)?, read_optional(key_path)?) {
            (Some(cert_pem), Some(key_pem)) => {
                let ca = Self::from_pem(common_name, cert_pem, key_pem)
                    .with_context(|| format!("failed to load CA from {}", cert_path.display()))?;
                info!(path = %cert_path.display(), "Loaded {common_name} CA");
                Ok(ca)
            }
            (None, None) => {
                let ca = Self::generate(common_name)?;
                write_pem(cert_path, &ca.cert_pem, CERT_FILE_MODE)?;
                write_pem(key_path, &ca.key_pem, KEY_FILE_MODE)?;
                info!(path = %cert_path.display(), "Created {common_name} CA");
                Ok(ca)
            }
            _ => Err(incomplete_pair(cert_path, key_path).into()),
        }
    }

    /// Generates a new self-signed root, valid for ten years.
    pub fn generate(common_name: &str) -> Result<Self, Error> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CA_VALIDITY;

        let key_pair = KeyPair::generate().map_err(Error::certificate)?;
        let cert = params.self_signed(&key_pair).map_err(Error::certificate)?;
        Ok(CertificateAuthority {
            common_name: common_name.to_owned(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Wraps existing PEM material, checking that it can actually sign.
    pub fn from_pem(
        common_name: &str,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Result<Self, Error> {
        let ca = CertificateAuthority {
            common_name: common_name.to_owned(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        };
        ca.issuer()?;
        Ok(ca)
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>, Error> {
        let key_pair = KeyPair::from_pem(&self.key_pem).map_err(Error::certificate)?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key_pair).map_err(Error::certificate)
    }

    /// Issues a 30-day certificate for `target`, usable for both server and client
    /// authentication.
    ///
    /// The subject alternative names are the target's address and name, followed by
    /// `extra_alt_names`. Extras that parse as IP addresses become IP entries; everything else
    /// becomes a DNS entry. Duplicates are dropped.
    pub fn issue_server_certificate(
        &self,
        common_name: &str,
        organization: &str,
        target: &Node,
        extra_alt_names: &[String],
    ) -> Result<CertificatePair, Error> {
        let mut alt_names = vec![SanType::IpAddress(target.address)];
        for name in std::iter::once(&target.name).chain(extra_alt_names) {
            let san = match name.parse::<IpAddr>() {
                Ok(address) => SanType::IpAddress(address),
                Err(_) => SanType::DnsName(
                    Ia5String::try_from(name.as_str()).map_err(Error::certificate)?,
                ),
            };
            if !alt_names.contains(&san) {
                alt_names.push(san);
            }
        }
        self.issue(common_name, organization, alt_names)
    }

    /// Issues a 30-day client certificate without any alternative names.
    ///
    /// Used for identities such as the cluster administrator, where `organization` carries the
    /// group membership.
    pub fn issue_client_certificate(
        &self,
        common_name: &str,
        organization: &str,
    ) -> Result<CertificatePair, Error> {
        self.issue(common_name, organization, Vec::new())
    }

    fn issue(
        &self,
        common_name: &str,
        organization: &str,
        alt_names: Vec<SanType>,
    ) -> Result<CertificatePair, Error> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.subject_alt_names = alt_names;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;

        let key_pair = KeyPair::generate().map_err(Error::certificate)?;
        let cert = params
            .signed_by(&key_pair, &self.issuer()?)
            .map_err(Error::certificate)?;
        Ok(CertificatePair {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// The key pair the API server uses to sign and verify service-account tokens.
///
/// Like a root, it is created once per cluster and reused afterward.
#[derive(Clone, Debug)]
pub struct ServiceAccountKeys {
    public_key_pem: String,
    private_key_pem: String,
}

impl ServiceAccountKeys {
    /// Loads the key pair stored at `public_path` and `private_path`, or creates and stores a new
    /// one if neither file exists.
    ///
    /// # Errors
    ///
    /// Same rules as [CertificateAuthority::load_or_create].
    pub fn load_or_create(
        public_path: impl AsRef<Path>,
        private_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let (public_path, private_path) = (public_path.as_ref(), private_path.as_ref());
        match (read_optional(public_path)?, read_optional(private_path)?) {
            (Some(public_key_pem), Some(private_key_pem)) => {
                KeyPair::from_pem(&private_key_pem)
                    .map_err(Error::certificate)
                    .with_context(|| {
                        format!("failed to load {}", private_path.display())
                    })?;
                Ok(ServiceAccountKeys {
                    public_key_pem,
                    private_key_pem,
                })
            }
            (None, None) => {
                let key_pair = KeyPair::generate().map_err(Error::certificate)?;
                let keys = ServiceAccountKeys {
                    public_key_pem: key_pair.public_key_pem(),
                    private_key_pem: key_pair.serialize_pem(),
                };
                write_pem(public_path, &keys.public_key_pem, CERT_FILE_MODE)?;
                write_pem(private_path, &keys.private_key_pem, KEY_FILE_MODE)?;
                info!(path = %private_path.display(), "Created service-account key pair");
                Ok(keys)
            }
            _ => Err(incomplete_pair(public_path, private_path).into()),
        }
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_owned()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_owned()),
    );
    dn
}

fn incomplete_pair(first: &Path, second: &Path) -> Error {
    Error::certificate(format!(
        "only one of {} and {} exists; restore the missing file or remove both",
        first.display(),
        second.display()
    ))
}

/// Reads `path`, returning [None] if it doesn't exist.
fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Writes `content` to `path` with `mode`, creating parent directories as needed.
fn write_pem(path: &Path, content: &str, mode: u32) -> anyhow::Result<()> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        // The mode given to open only applies to new files.
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    };
    write().with_context(|| format!("failed to write {}", path.display()))
}
