//! Image reference parsing and relocation.
//!
//! References have the form `[registry/]repository[:tag|@digest]`. The first
//! path component is treated as a registry when it contains a `.` or `:`, or
//! is `localhost`; otherwise the configured default registry applies.

use crate::digest::Digest;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Registry assumed by [`ParseOptions::strict`].
pub const DOCKER_HUB_REGISTRY: &str = "index.docker.io";

/// Tag assumed when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;
const MAX_REPOSITORY_LEN: usize = 255;

/// Defaults applied while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Registry used when the reference names none. May be empty.
    pub default_registry: String,
    /// Tag used when the reference names neither tag nor digest.
    pub default_tag: String,
}

impl ParseOptions {
    /// Docker-compatible defaults: `index.docker.io` and `latest`.
    pub fn strict() -> Self {
        Self {
            default_registry: DOCKER_HUB_REGISTRY.to_string(),
            default_tag: DEFAULT_TAG.to_string(),
        }
    }

    /// Store defaults: no implicit registry, tag `latest`.
    pub fn store() -> Self {
        Self {
            default_registry: String::new(),
            default_tag: DEFAULT_TAG.to_string(),
        }
    }

    pub fn with_default_registry(mut self, registry: impl Into<String>) -> Self {
        self.default_registry = registry.into();
        self
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::strict()
    }
}

/// Tag or digest identifying one manifest within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Mutable tag.
    Tag(String),
    /// Immutable content digest.
    Digest(Digest),
}

impl Identifier {
    pub fn is_digest(&self) -> bool {
        matches!(self, Identifier::Digest(_))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Tag(tag) => write!(f, "{tag}"),
            Identifier::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    identifier: Identifier,
}

impl Reference {
    /// Parse with Docker-compatible defaults.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_with(reference, &ParseOptions::strict())
    }

    /// Parse with explicit defaults.
    pub fn parse_with(reference: &str, opts: &ParseOptions) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::invalid_reference(reference, "empty reference"));
        }

        // Digest first; a tag alongside a digest is dropped.
        let (name_part, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest)
                    .map_err(|e| Error::invalid_reference(reference, e.to_string()))?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A colon only starts a tag when no slash follows it (`host:5000/repo`).
        let (context, tag) = match name_part.rfind(':') {
            Some(pos) if !name_part[pos + 1..].contains('/') => {
                (&name_part[..pos], Some(&name_part[pos + 1..]))
            }
            _ => (name_part, None),
        };

        let (registry, repository) = split_registry(context, &opts.default_registry);

        let identifier = match (digest, tag) {
            (Some(digest), _) => Identifier::Digest(digest),
            (None, Some(tag)) => Identifier::Tag(tag.to_string()),
            (None, None) => Identifier::Tag(opts.default_tag.clone()),
        };

        Self::new(registry, repository, identifier)
            .map_err(|e| Error::invalid_reference(reference, reason_of(e)))
    }

    /// Build a reference from components, validating each of them.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        identifier: Identifier,
    ) -> Result<Self> {
        let registry = normalize_registry(registry.into());
        let mut repository = repository.into();

        validate_registry(&registry)?;
        if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            repository = format!("library/{repository}");
        }
        validate_repository(&repository)?;
        if let Identifier::Tag(tag) = &identifier {
            validate_tag(tag)?;
        }

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Registry host, possibly empty.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path, e.g. `library/nginx`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn is_digest(&self) -> bool {
        self.identifier.is_digest()
    }

    /// `[registry/]repository`.
    pub fn context(&self) -> String {
        if self.registry.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// `[registry/]repository:tag` or `[registry/]repository@digest`.
    pub fn name(&self) -> String {
        match &self.identifier {
            Identifier::Tag(tag) => format!("{}:{}", self.context(), tag),
            Identifier::Digest(digest) => format!("{}@{}", self.context(), digest),
        }
    }

    /// Same repository and identifier under another registry.
    pub fn with_registry(&self, registry: &str) -> Result<Self> {
        Self::new(registry, self.repository.clone(), self.identifier.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Rewrite the registry of `reference`, keeping its repository and whether it
/// is tag- or digest-addressed.
///
/// The registry must read back as a registry host (it contains `.` or `:`, or
/// is `localhost`); a bare word like `mirror` would parse as the first
/// repository component instead.
pub fn relocate(reference: &str, registry: &str) -> Result<Reference> {
    if registry.is_empty() {
        return Err(Error::invalid_reference(reference, "target registry is empty"));
    }
    let parsed = Reference::parse(reference)?;
    parsed
        .with_registry(registry)
        .map_err(|e| Error::invalid_reference(reference, reason_of(e)))
}

fn split_registry(context: &str, default_registry: &str) -> (String, String) {
    if let Some((first, rest)) = context.split_once('/')
        && is_registry_host(first)
    {
        return (first.to_string(), rest.to_string());
    }
    (default_registry.to_string(), context.to_string())
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn normalize_registry(registry: String) -> String {
    if registry == "docker.io" {
        DOCKER_HUB_REGISTRY.to_string()
    } else {
        registry
    }
}

fn validate_registry(registry: &str) -> Result<()> {
    if !registry.is_empty() && !is_registry_host(registry) {
        return Err(Error::invalid_reference(
            registry,
            format!("{registry:?} is not a registry host; add a domain or port"),
        ));
    }
    if registry
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
    {
        Ok(())
    } else {
        Err(Error::invalid_reference(
            registry,
            format!("registry {registry:?} contains invalid characters"),
        ))
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(Error::invalid_reference(repository, "empty repository"));
    }
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(Error::invalid_reference(
            repository,
            format!("repository longer than {MAX_REPOSITORY_LEN} characters"),
        ));
    }
    for component in repository.split('/') {
        if !valid_path_component(component) {
            return Err(Error::invalid_reference(
                repository,
                format!("invalid repository component {component:?}"),
            ));
        }
    }
    Ok(())
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or one or more `-`.
fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        let ok = sep == "." || sep == "_" || sep == "__" || sep.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_reference(tag, format!("invalid tag {tag:?}")))
    }
}

fn reason_of(err: Error) -> String {
    match err {
        Error::InvalidReference { reason, .. } => reason,
        other => other.to_string(),
    }
}
