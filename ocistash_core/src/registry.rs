//! Copy target backed by a remote OCI distribution registry.
//!
//! Talks to the registry through `oci-distribution`. The store API is
//! synchronous, so the target owns a current-thread tokio runtime and blocks
//! on each request.

use crate::descriptor::{Descriptor, DescriptorExt, media_types};
use crate::digest::{Digest, Digester};
use crate::error::{Error, Result};
use crate::transfer::Target;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference as RemoteReference, RegistryOperation};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Environment variable holding the registry user name.
pub const USERNAME_ENV: &str = "OCISTASH_REGISTRY_USERNAME";
/// Environment variable holding the registry password or token.
pub const PASSWORD_ENV: &str = "OCISTASH_REGISTRY_PASSWORD";

const MANIFEST_MEDIA_TYPES: &[&str] = &[
    media_types::OCI_MANIFEST,
    media_types::OCI_INDEX,
    media_types::DOCKER_MANIFEST_SCHEMA2,
    media_types::DOCKER_MANIFEST_LIST,
];

/// Credentials presented to the registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Basic credentials from `OCISTASH_REGISTRY_USERNAME` and
    /// `OCISTASH_REGISTRY_PASSWORD`, or anonymous unless both are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match (lookup(USERNAME_ENV), lookup(PASSWORD_ENV)) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    fn to_registry_auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            _ => RegistryAuth::Anonymous,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Connection settings for a [`RegistryTarget`].
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub credentials: Credentials,
    /// Speak plain HTTP instead of HTTPS, for local registries.
    pub plain_http: bool,
}

impl RegistryConfig {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            protocol: if self.plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            ..Default::default()
        }
    }
}

/// A [`Target`] that reads from and writes to registries.
///
/// Every reference handed to it names its registry and repository, so one
/// target serves any number of repositories. Manifests seen during a copy are
/// kept in memory so tagging does not fetch them again.
pub struct RegistryTarget {
    client: Client,
    auth: RegistryAuth,
    runtime: Runtime,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
    // (registry/repository, push)
    authenticated: Mutex<HashSet<(String, bool)>>,
}

impl RegistryTarget {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            client: Client::new(config.client_config()),
            auth: config.credentials.to_registry_auth(),
            runtime,
            manifests: Mutex::new(HashMap::new()),
            authenticated: Mutex::new(HashSet::new()),
        })
    }

    fn authenticate(&self, reference: &RemoteReference, push: bool) -> Result<()> {
        let key = (
            format!("{}/{}", reference.registry(), reference.repository()),
            push,
        );
        if self.lock_authenticated().contains(&key) {
            return Ok(());
        }

        let operation = if push {
            RegistryOperation::Push
        } else {
            RegistryOperation::Pull
        };
        self.runtime
            .block_on(self.client.auth(reference, &self.auth, operation))
            .map_err(|e| registry_error(reference, e))?;
        debug!(repository = %key.0, push, "authenticated");
        self.lock_authenticated().insert(key);
        Ok(())
    }

    fn lock_authenticated(&self) -> std::sync::MutexGuard<'_, HashSet<(String, bool)>> {
        self.authenticated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_manifest(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.manifests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&digest.to_string())
            .cloned()
    }

    fn remember_manifest(&self, digest: &Digest, data: Vec<u8>) {
        self.manifests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(digest.to_string(), data);
    }

    /// Manifest bytes for `digest`, from memory or the registry, verified.
    fn manifest(&self, reference: &RemoteReference, desc: &Descriptor) -> Result<Vec<u8>> {
        let digest = desc.content_digest()?;
        if let Some(data) = self.cached_manifest(&digest) {
            return Ok(data);
        }

        self.authenticate(reference, false)?;
        let pinned = pinned(reference, desc.digest());
        let (data, _) = self
            .runtime
            .block_on(
                self.client
                    .pull_manifest_raw(&pinned, &self.auth, MANIFEST_MEDIA_TYPES),
            )
            .map_err(|e| registry_error(&pinned, e))?;
        verify(&digest, Some(desc.content_size()), &data)?;
        self.remember_manifest(&digest, data.clone());
        Ok(data)
    }

    fn push_manifest(&self, target: &RemoteReference, digest: &Digest, data: &[u8]) -> Result<()> {
        let manifest = reencodable(digest, data)?;
        self.authenticate(target, true)?;
        self.runtime
            .block_on(self.client.push_manifest(target, &manifest))
            .map_err(|e| registry_error(target, e))?;
        Ok(())
    }
}

impl Target for RegistryTarget {
    fn resolve(&self, name: &str) -> Result<Descriptor> {
        let reference = remote(name)?;
        self.authenticate(&reference, false)?;
        let (data, digest) = self
            .runtime
            .block_on(
                self.client
                    .pull_manifest_raw(&reference, &self.auth, MANIFEST_MEDIA_TYPES),
            )
            .map_err(|e| registry_error(&reference, e))?;

        let digest = Digest::parse(&digest)?;
        verify(&digest, None, &data)?;
        let desc = Descriptor::for_digest(&manifest_media_type(&data), &digest, data.len() as u64);
        debug!(reference = name, %digest, "resolved in registry");
        self.remember_manifest(&digest, data);
        Ok(desc)
    }

    fn fetch(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn Read + Send>> {
        let reference = remote(reference)?;
        if desc.is_manifest() {
            return Ok(Box::new(Cursor::new(self.manifest(&reference, desc)?)));
        }

        self.authenticate(&reference, false)?;
        let mut spool = tempfile::tempfile()?;
        let mut out = tokio::fs::File::from_std(spool.try_clone()?);
        let layer = oci_descriptor(desc);
        self.runtime.block_on(async {
            self.client
                .pull_blob(&reference, &layer, &mut out)
                .await
                .map_err(|e| registry_error(&reference, e))?;
            out.flush().await?;
            Ok::<(), Error>(())
        })?;
        drop(out);
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }

    /// Manifests are checked by digest. Blobs always report absent: the
    /// registry answers an upload of content it already holds cheaply.
    fn exists(&self, reference: &str, desc: &Descriptor) -> Result<bool> {
        if !desc.is_manifest() {
            return Ok(false);
        }
        let digest = desc.content_digest()?;
        if self.cached_manifest(&digest).is_some() {
            return Ok(true);
        }

        let reference = remote(reference)?;
        self.authenticate(&reference, false)?;
        let pinned = pinned(&reference, desc.digest());
        match self
            .runtime
            .block_on(self.client.fetch_manifest_digest(&pinned, &self.auth))
        {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(reference = %pinned, error = %e, "manifest not in registry");
                Ok(false)
            }
        }
    }

    fn push(&self, reference: &str, desc: &Descriptor, content: &mut dyn Read) -> Result<()> {
        let digest = desc.content_digest()?;
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        verify(&digest, Some(desc.content_size()), &data)?;

        let reference = remote(reference)?;
        if desc.is_manifest() {
            self.push_manifest(&pinned(&reference, desc.digest()), &digest, &data)?;
            self.remember_manifest(&digest, data);
        } else {
            self.authenticate(&reference, true)?;
            self.runtime
                .block_on(self.client.push_blob(&reference, &data, desc.digest()))
                .map_err(|e| registry_error(&reference, e))?;
        }
        debug!(reference = %reference, %digest, size = desc.content_size(), "pushed");
        Ok(())
    }

    /// Push the manifest again under the tag of `name`. A digest-pinned name
    /// needs nothing: the manifest is already addressable by its digest.
    fn tag(&self, desc: &Descriptor, name: &str) -> Result<()> {
        let reference = remote(name)?;
        let Some(tag) = reference.tag() else {
            return Ok(());
        };
        let target = RemoteReference::with_tag(
            reference.registry().to_string(),
            reference.repository().to_string(),
            tag.to_string(),
        );

        let digest = desc.content_digest()?;
        let data = self.manifest(&reference, desc)?;
        self.push_manifest(&target, &digest, &data)?;
        info!(reference = name, %digest, "tagged in registry");
        Ok(())
    }
}

fn remote(reference: &str) -> Result<RemoteReference> {
    reference
        .parse::<RemoteReference>()
        .map_err(|e| Error::invalid_reference(reference, e.to_string()))
}

/// `reference`'s repository, addressed by `digest`.
fn pinned(reference: &RemoteReference, digest: &str) -> RemoteReference {
    RemoteReference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

fn registry_error(reference: &RemoteReference, e: impl fmt::Display) -> Error {
    Error::registry(format!("{}: {}", reference, e))
}

fn verify(digest: &Digest, size: Option<u64>, data: &[u8]) -> Result<()> {
    let mut digester = Digester::new(digest.algorithm());
    digester.update(data);
    digester.verify(digest, size)
}

/// Media type named inside a manifest document. Documents without the
/// field are told apart by their `manifests` list.
fn manifest_media_type(data: &[u8]) -> String {
    let value: serde_json::Value = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(_) => return media_types::OCI_MANIFEST.to_string(),
    };
    if let Some(media_type) = value.get("mediaType").and_then(serde_json::Value::as_str) {
        return media_type.to_string();
    }
    if value.get("manifests").is_some() {
        media_types::OCI_INDEX.to_string()
    } else {
        media_types::OCI_MANIFEST.to_string()
    }
}

/// Parse manifest bytes for upload.
///
/// The client serializes the parsed document again before sending it, so the
/// upload is refused when that would change the digest.
fn reencodable(digest: &Digest, data: &[u8]) -> Result<OciManifest> {
    let manifest: OciManifest = serde_json::from_slice(data)?;
    let encoded = serde_json::to_vec(&manifest)?;
    let actual = Digest::from_bytes(digest.algorithm(), &encoded);
    if actual != *digest {
        return Err(Error::registry(format!(
            "manifest {} is not in canonical form; uploading it would change its digest to {}",
            digest, actual
        )));
    }
    Ok(manifest)
}

fn oci_descriptor(desc: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: desc.media_type_str(),
        digest: desc.digest().clone(),
        size: i64::try_from(desc.content_size()).unwrap_or(i64::MAX),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::image_manifest;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_credentials_from_lookup() {
        let creds = Credentials::from_lookup(lookup(&[(USERNAME_ENV, "u"), (PASSWORD_ENV, "p")]));
        assert_eq!(creds, Credentials::basic("u", "p"));
        assert!(matches!(creds.to_registry_auth(), RegistryAuth::Basic(u, p) if u == "u" && p == "p"));

        let half = Credentials::from_lookup(lookup(&[(USERNAME_ENV, "u")]));
        assert!(half.is_anonymous());
        assert!(matches!(half.to_registry_auth(), RegistryAuth::Anonymous));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let shown = format!("{:?}", Credentials::basic("alice", "hunter2"));
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_client_protocol_follows_plain_http() {
        let config = RegistryConfig {
            plain_http: true,
            ..Default::default()
        };
        assert!(matches!(config.client_config().protocol, ClientProtocol::Http));
        assert!(matches!(
            RegistryConfig::default().client_config().protocol,
            ClientProtocol::Https
        ));
    }

    #[test]
    fn test_remote_references() {
        let reference = remote("mirror.local:5000/team/app:v1").unwrap();
        assert_eq!(reference.registry(), "mirror.local:5000");
        assert_eq!(reference.repository(), "team/app");
        assert_eq!(reference.tag(), Some("v1"));

        let digest = Digest::sha256(b"x").to_string();
        let pinned = pinned(&reference, &digest);
        assert_eq!(pinned.registry(), "mirror.local:5000");
        assert_eq!(pinned.repository(), "team/app");
        assert_eq!(pinned.digest(), Some(digest.as_str()));

        assert!(remote("UPPER/case").is_err());
    }

    #[test]
    fn test_manifest_media_type() {
        assert_eq!(
            manifest_media_type(br#"{"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#),
            media_types::DOCKER_MANIFEST_SCHEMA2
        );
        assert_eq!(
            manifest_media_type(br#"{"schemaVersion":2,"manifests":[]}"#),
            media_types::OCI_INDEX
        );
        assert_eq!(
            manifest_media_type(br#"{"schemaVersion":2,"layers":[]}"#),
            media_types::OCI_MANIFEST
        );
    }

    #[test]
    fn test_reencoding_must_keep_digest() {
        let config = Descriptor::for_bytes(media_types::FILE_CONFIG, b"{}");
        let layer = Descriptor::for_bytes(media_types::FILE_LAYER, b"payload");
        let manifest = image_manifest(config, vec![layer]).unwrap();
        let pretty = serde_json::to_vec_pretty(&manifest).unwrap();
        let err = reencodable(&Digest::sha256(&pretty), &pretty).unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));

        let parsed: OciManifest = serde_json::from_slice(&pretty).unwrap();
        let canonical = serde_json::to_vec(&parsed).unwrap();
        assert!(reencodable(&Digest::sha256(&canonical), &canonical).is_ok());
    }

    #[test]
    fn test_push_verifies_before_any_request() {
        let target = RegistryTarget::new(RegistryConfig::default()).unwrap();
        let desc = Descriptor::for_bytes(media_types::FILE_LAYER, b"expected");
        let err = target
            .push("registry.invalid/app:v1", &desc, &mut &b"tampered"[..])
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[test]
    fn test_digest_pinned_tag_is_noop() {
        let target = RegistryTarget::new(RegistryConfig::default()).unwrap();
        let desc = Descriptor::for_bytes(media_types::OCI_MANIFEST, b"{}");
        let name = format!("registry.invalid/app@{}", desc.digest());
        target.tag(&desc, &name).unwrap();
    }

    #[test]
    fn test_oci_descriptor_mapping() {
        let desc = Descriptor::for_bytes(media_types::FILE_LAYER, b"abc");
        let layer = oci_descriptor(&desc);
        assert_eq!(layer.media_type, media_types::FILE_LAYER);
        assert_eq!(&layer.digest, desc.digest());
        assert_eq!(layer.size, 3);
    }
}
