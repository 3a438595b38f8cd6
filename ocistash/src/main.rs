mod output;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ocistash_core::{
    Artifact, ChartArtifact, Context, Credentials, DescriptorExt, FileArtifact, FsCache,
    ImageArtifact, ImageManifest, OciLayout, RegistryConfig, RegistryTarget, Store, Target,
    relocate,
};
use output::{
    AddOutput, CopiedRef, CopyOutput, ExtractOutput, FlushOutput, GcOutput, InfoOutput, LsOutput,
    OutputWriter, PullOutput, RefInfo,
};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// ocistash - A content-addressed artifact store on the OCI image layout
#[derive(Parser)]
#[command(name = "ocistash")]
#[command(about = "Store files, charts and images as OCI content", long_about = None)]
#[command(version)]
struct Cli {
    /// Store directory (defaults to OCISTASH_DIR env var or ./store)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Blob cache directory (defaults to OCISTASH_CACHE_DIR env var; disabled if unset)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Abort the operation after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add content to the store
    #[command(subcommand)]
    Add(AddCommands),

    /// List stored references
    Ls,

    /// Show what a reference points at
    Info {
        /// Reference to inspect
        reference: String,
    },

    /// Write a manifest (by reference) or a blob (by digest) to stdout
    Cat {
        /// Reference whose manifest to print
        #[arg(required_unless_present = "digest", conflicts_with = "digest")]
        reference: Option<String>,

        /// Digest of a blob to print
        #[arg(long)]
        digest: Option<String>,
    },

    /// Copy every reference into another OCI layout directory
    Copy {
        /// Destination layout directory (created if missing)
        target: PathBuf,

        /// Rewrite references to this registry
        #[arg(long)]
        registry: Option<String>,
    },

    /// Copy every reference into a registry
    Push {
        /// Registry host, optionally with a port (e.g. registry.example.com:5000)
        registry: String,

        /// Talk plain HTTP instead of HTTPS
        #[arg(long)]
        plain_http: bool,
    },

    /// Copy an image from a registry into the store
    Pull {
        /// Remote reference (registry/repository[:tag|@digest])
        remote: String,

        /// Reference to store it under (defaults to the remote reference)
        #[arg(long = "ref")]
        reference: Option<String>,

        /// Talk plain HTTP instead of HTTPS
        #[arg(long)]
        plain_http: bool,
    },

    /// Write the titled layers of a reference into a directory
    Extract {
        /// Reference to extract
        reference: String,

        /// Destination directory
        #[arg(default_value = ".")]
        dest: PathBuf,
    },

    /// Delete all store content (blobs, index.json, oci-layout)
    Flush,

    /// Delete blobs no reference reaches
    Gc {
        /// Dry run - show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum AddCommands {
    /// Add a file (use - to read stdin)
    File {
        /// File to add
        path: PathBuf,

        /// Reference to store it under (defaults to the file name)
        #[arg(long = "ref")]
        reference: Option<String>,

        /// Layer title (defaults to the file name; required for stdin)
        #[arg(long)]
        name: Option<String>,
    },

    /// Add a packaged chart (.tgz)
    Chart {
        /// Chart archive
        path: PathBuf,

        /// Reference to store it under (defaults to name:version)
        #[arg(long = "ref")]
        reference: Option<String>,
    },

    /// Add an image from an OCI layout directory
    Image {
        /// OCI layout directory holding the image
        layout: PathBuf,

        /// Reference to store it under
        #[arg(long = "ref")]
        reference: String,

        /// Name of the image inside the layout (needed when it holds several)
        #[arg(long)]
        source_ref: Option<String>,
    },
}

/// Global settings shared by all commands.
struct Settings {
    store: PathBuf,
    cache: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Settings {
    fn open_store(&self) -> Result<Store> {
        tracing::debug!(
            store = %self.store.display(),
            cache = ?self.cache,
            "opening store"
        );
        let mut store = Store::open(&self.store)
            .with_context(|| format!("Failed to open store at {}", self.store.display()))?;
        if let Some(cache_dir) = &self.cache {
            let cache = FsCache::open(cache_dir)
                .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?;
            store = store.with_cache(Arc::new(cache));
        }
        Ok(store)
    }

    fn registry(&self, plain_http: bool) -> Result<RegistryTarget> {
        let credentials = Credentials::from_env();
        tracing::debug!(plain_http, anonymous = credentials.is_anonymous(), "registry client");
        RegistryTarget::new(RegistryConfig {
            credentials,
            plain_http,
        })
        .context("Failed to start registry client")
    }

    fn context(&self) -> Context {
        match self.timeout {
            Some(timeout) => Context::background().with_timeout(timeout),
            None => Context::background(),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = OutputWriter::new(cli.json);

    // Determine store root: CLI arg > OCISTASH_DIR env var > ./store default
    let settings = Settings {
        store: cli
            .store
            .or_else(|| std::env::var("OCISTASH_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./store")),
        cache: cli
            .cache
            .or_else(|| std::env::var("OCISTASH_CACHE_DIR").ok().map(PathBuf::from)),
        timeout: cli.timeout.map(Duration::from_secs),
    };

    if let Err(e) = run(cli.command, &settings, &output) {
        output.write_error(&e, 1);
        std::process::exit(1);
    }
}

/// Logs go to stderr; stdout carries command output only.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(command: Commands, settings: &Settings, output: &OutputWriter) -> Result<()> {
    match command {
        Commands::Add(add) => cmd_add(settings, output, add),
        Commands::Ls => cmd_ls(settings, output),
        Commands::Info { reference } => cmd_info(settings, output, &reference),
        Commands::Cat { reference, digest } => cmd_cat(settings, reference, digest),
        Commands::Copy { target, registry } => {
            cmd_copy(settings, output, &target, registry.as_deref())
        }
        Commands::Push {
            registry,
            plain_http,
        } => cmd_push(settings, output, &registry, plain_http),
        Commands::Pull {
            remote,
            reference,
            plain_http,
        } => cmd_pull(settings, output, &remote, reference.as_deref(), plain_http),
        Commands::Extract { reference, dest } => cmd_extract(settings, output, &reference, &dest),
        Commands::Flush => cmd_flush(settings, output),
        Commands::Gc { dry_run } => cmd_gc(settings, output, dry_run),
    }
}

fn cmd_add(settings: &Settings, output: &OutputWriter, add: AddCommands) -> Result<()> {
    let (artifact, reference) = load_artifact(add)?;
    let kind = artifact.kind();
    let store = settings.open_store()?;
    let desc = store
        .add_artifact(&settings.context(), &artifact, &reference)
        .with_context(|| format!("Failed to add {} as {}", kind, reference))?;

    let data = AddOutput {
        success: true,
        result_code: 0,
        kind: kind.to_string(),
        reference: reference.clone(),
        digest: desc.digest().clone(),
        media_type: desc.media_type_str(),
        size: desc.content_size(),
    };
    output.write(&data, || format!("{} {} {}\n", kind, reference, desc.digest()))
}

/// The artifact an `add` subcommand names, with the reference to store it under.
fn load_artifact(add: AddCommands) -> Result<(Artifact, String)> {
    Ok(match add {
        AddCommands::File {
            path,
            reference,
            name,
        } => {
            let artifact = if path == Path::new("-") {
                let name = name.context("--name is required when reading from stdin")?;
                let mut data = Vec::new();
                io::stdin()
                    .read_to_end(&mut data)
                    .context("Failed to read stdin")?;
                FileArtifact::from_bytes(name, data)
            } else {
                let artifact = FileArtifact::from_path(&path);
                match name {
                    Some(name) => artifact.with_name(name),
                    None => artifact,
                }
            };
            let reference = match reference {
                Some(reference) => reference,
                None => default_file_reference(artifact.name())?,
            };
            (Artifact::File(artifact), reference)
        }
        AddCommands::Chart { path, reference } => {
            let chart = ChartArtifact::open(&path)
                .with_context(|| format!("Failed to read chart {}", path.display()))?;
            let reference = reference.unwrap_or_else(|| chart.default_reference());
            (Artifact::Chart(chart), reference)
        }
        AddCommands::Image {
            layout,
            reference,
            source_ref,
        } => {
            let image = ImageArtifact::open(&layout, source_ref.as_deref())
                .with_context(|| format!("Failed to read image from {}", layout.display()))?;
            (Artifact::Image(image), reference)
        }
    })
}

/// Reference for a file added without `--ref`: the file name, lowercased,
/// with characters outside the repository grammar replaced by `-`.
fn default_file_reference(name: &str) -> Result<String> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    // Separators may only sit between alphanumerics, one at a time
    let mut repository = String::with_capacity(base.len());
    for c in base.chars().flat_map(char::to_lowercase) {
        let c = match c {
            'a'..='z' | '0'..='9' | '.' | '_' => c,
            _ => '-',
        };
        let after_separator = repository
            .chars()
            .last()
            .is_none_or(|last| !last.is_ascii_alphanumeric());
        if !c.is_ascii_alphanumeric() && after_separator {
            continue;
        }
        repository.push(c);
    }
    let repository = repository.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if repository.is_empty() {
        anyhow::bail!("Cannot derive a reference from {:?}; pass --ref", name);
    }
    Ok(format!("{}:latest", repository))
}

fn cmd_ls(settings: &Settings, output: &OutputWriter) -> Result<()> {
    let store = settings.open_store()?;
    let refs: Vec<RefInfo> = store
        .references()
        .context("Failed to list references")?
        .into_iter()
        .map(|(name, desc)| {
            let config_media_type = store.identify(&desc);
            RefInfo::new(name, &desc, config_media_type)
        })
        .collect();

    let data = LsOutput {
        success: true,
        result_code: 0,
        refs,
    };
    output.write(&data, || {
        if data.refs.is_empty() {
            return "No references (use 'ocistash add' to create one)\n".to_string();
        }
        data.refs
            .iter()
            .map(|r| {
                let kind = if r.config_media_type.is_empty() {
                    "-"
                } else {
                    r.config_media_type.as_str()
                };
                format!("{} {} {} {}\n", r.name, r.digest, r.size, kind)
            })
            .collect()
    })
}

fn cmd_info(settings: &Settings, output: &OutputWriter, reference: &str) -> Result<()> {
    let store = settings.open_store()?;
    let desc = store
        .resolve(reference)
        .with_context(|| format!("Failed to resolve {}", reference))?;
    let name = desc.ref_name().unwrap_or(reference).to_string();

    let mut manifest = Vec::new();
    store
        .open_blob(&desc)
        .and_then(|mut file| Ok(file.read_to_end(&mut manifest)?))
        .with_context(|| format!("Failed to read manifest {}", desc.digest()))?;
    let layers = serde_json::from_slice::<ImageManifest>(&manifest)
        .map(|m| m.layers().clone())
        .unwrap_or_default();

    let data = InfoOutput {
        success: true,
        result_code: 0,
        reference: RefInfo::new(name, &desc, store.identify(&desc)),
        layers,
    };
    output.write(&data, || {
        let mut text = format!(
            "Reference: {}\nDigest: {}\nMedia type: {}\nSize: {} bytes\nConfig: {}\n",
            data.reference.name,
            data.reference.digest,
            data.reference.media_type,
            data.reference.size,
            data.reference.config_media_type,
        );
        for layer in &data.layers {
            let label = match layer.title() {
                Some(title) => title.to_string(),
                None => layer.media_type_str(),
            };
            text.push_str(&format!(
                "Layer: {} {} {}\n",
                layer.digest(),
                layer.content_size(),
                label
            ));
        }
        text
    })
}

fn cmd_cat(settings: &Settings, reference: Option<String>, digest: Option<String>) -> Result<()> {
    let store = settings.open_store()?;

    let path = match (reference, digest) {
        (_, Some(digest)) => store
            .blob_path(&digest)
            .with_context(|| format!("Failed to find blob {}", digest))?,
        (Some(reference), None) => {
            let desc = store
                .resolve(&reference)
                .with_context(|| format!("Failed to resolve {}", reference))?;
            store.layout().blob_path(&desc.content_digest()?)
        }
        (None, None) => anyhow::bail!("Pass a reference or --digest"),
    };

    let mut file = std::fs::File::open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    io::copy(&mut file, &mut handle).context("Failed to write to stdout")?;
    handle.flush()?;
    Ok(())
}

fn cmd_copy(
    settings: &Settings,
    output: &OutputWriter,
    target_dir: &Path,
    registry: Option<&str>,
) -> Result<()> {
    let target = OciLayout::create(target_dir)
        .with_context(|| format!("Failed to open target layout {}", target_dir.display()))?;
    copy_to(
        settings,
        output,
        &target,
        &target_dir.display().to_string(),
        registry,
    )
}

fn cmd_push(
    settings: &Settings,
    output: &OutputWriter,
    registry: &str,
    plain_http: bool,
) -> Result<()> {
    let target = settings.registry(plain_http)?;
    copy_to(settings, output, &target, registry, Some(registry))
}

/// Copy every stored reference to `target`, relocated to `registry` if given.
fn copy_to(
    settings: &Settings,
    output: &OutputWriter,
    target: &dyn Target,
    label: &str,
    registry: Option<&str>,
) -> Result<()> {
    let store = settings.open_store()?;
    let copied = RefCell::new(Vec::new());
    let mapper = |name: &str| -> ocistash_core::Result<String> {
        let to = match registry {
            Some(registry) => relocate(name, registry)?.name(),
            None => name.to_string(),
        };
        copied.borrow_mut().push(CopiedRef {
            from: name.to_string(),
            to: to.clone(),
        });
        Ok(to)
    };

    store
        .copy_all(&settings.context(), target, Some(&mapper))
        .with_context(|| format!("Failed to copy to {}", label))?;

    let data = CopyOutput {
        success: true,
        result_code: 0,
        target: label.to_string(),
        copied: copied.into_inner(),
    };
    output.write(&data, || {
        data.copied
            .iter()
            .map(|c| format!("{} -> {}\n", c.from, c.to))
            .collect()
    })
}

fn cmd_pull(
    settings: &Settings,
    output: &OutputWriter,
    remote: &str,
    reference: Option<&str>,
    plain_http: bool,
) -> Result<()> {
    let source = settings.registry(plain_http)?;
    let reference = reference.unwrap_or(remote);
    let store = settings.open_store()?;
    let desc = store
        .pull(&settings.context(), &source, remote, reference)
        .with_context(|| format!("Failed to pull {}", remote))?;

    let data = PullOutput {
        success: true,
        result_code: 0,
        remote: remote.to_string(),
        reference: reference.to_string(),
        digest: desc.digest().clone(),
        size: desc.content_size(),
    };
    output.write(&data, || format!("{} -> {} {}\n", remote, reference, desc.digest()))
}

fn cmd_extract(
    settings: &Settings,
    output: &OutputWriter,
    reference: &str,
    dest: &Path,
) -> Result<()> {
    let store = settings.open_store()?;
    let files = store
        .extract(&settings.context(), reference, dest)
        .with_context(|| format!("Failed to extract {} to {}", reference, dest.display()))?;

    let data = ExtractOutput {
        success: true,
        result_code: 0,
        reference: reference.to_string(),
        files: files.iter().map(|p| p.display().to_string()).collect(),
    };
    output.write(&data, || {
        if data.files.is_empty() {
            return format!("{} has no titled layers\n", reference);
        }
        data.files.iter().map(|f| format!("{}\n", f)).collect()
    })
}

fn cmd_flush(settings: &Settings, output: &OutputWriter) -> Result<()> {
    // Flushing a store that is not there must not create one first
    let store = Store::at(&settings.store);
    store
        .flush(&settings.context())
        .with_context(|| format!("Failed to flush store at {}", settings.store.display()))?;

    let data = FlushOutput {
        success: true,
        result_code: 0,
        root: settings.store.display().to_string(),
    };
    output.write(&data, || {
        format!("Flushed store at {}\n", settings.store.display())
    })
}

fn cmd_gc(settings: &Settings, output: &OutputWriter, dry_run: bool) -> Result<()> {
    let store = settings.open_store()?;
    let stats = store
        .gc(dry_run)
        .context("Failed to run garbage collection")?;

    let data = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        blobs_deleted: stats.blobs_deleted,
        bytes_freed: stats.bytes_freed,
    };
    output.write(&data, || {
        if dry_run {
            format!(
                "Dry run - no blobs deleted\nWould delete {} blobs\nWould free {} bytes\n",
                stats.blobs_deleted, stats.bytes_freed
            )
        } else {
            format!(
                "Deleted {} blobs\nFreed {} bytes\n",
                stats.blobs_deleted, stats.bytes_freed
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    fn settings(temp_dir: &TempDir) -> Settings {
        Settings {
            store: temp_dir.path().join("store"),
            cache: None,
            timeout: None,
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_file() {
        let cli = Cli::try_parse_from([
            "ocistash", "--store", "/tmp/s", "add", "file", "notes.md", "--ref", "docs:v1",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s")));
        match cli.command {
            Commands::Add(AddCommands::File { reference, .. }) => {
                assert_eq!(reference.as_deref(), Some("docs:v1"));
            }
            _ => panic!("expected add file"),
        }
    }

    #[test]
    fn test_cat_requires_target() {
        assert!(Cli::try_parse_from(["ocistash", "cat"]).is_err());
        assert!(Cli::try_parse_from(["ocistash", "cat", "--digest", "sha256:x"]).is_ok());
        assert!(Cli::try_parse_from(["ocistash", "cat", "app:v1", "--digest", "sha256:x"]).is_err());
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::try_parse_from(["ocistash", "-vv", "ls"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_default_file_reference() {
        assert_eq!(default_file_reference("README.md").unwrap(), "readme.md:latest");
        assert_eq!(
            default_file_reference("dir/My File (1).tar.gz").unwrap(),
            "my-file-1-tar.gz:latest"
        );
        assert_eq!(default_file_reference("_x__y-").unwrap(), "x_y:latest");
        assert_eq!(default_file_reference("app_v2").unwrap(), "app_v2:latest");
        assert!(default_file_reference("!!!").is_err());
    }

    #[test]
    fn test_add_copy_and_gc() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(&temp_dir);
        let output = OutputWriter::new(true);

        let file = temp_dir.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();
        run(
            Commands::Add(AddCommands::File {
                path: file,
                reference: Some("myrepo".to_string()),
                name: None,
            }),
            &settings,
            &output,
        )
        .unwrap();

        let mirror = temp_dir.path().join("mirror");
        run(
            Commands::Copy {
                target: mirror.clone(),
                registry: Some("registry.example.com".to_string()),
            },
            &settings,
            &output,
        )
        .unwrap();
        let target = OciLayout::open(&mirror).unwrap();
        target
            .resolve("registry.example.com/library/myrepo:latest")
            .unwrap();

        run(Commands::Gc { dry_run: false }, &settings, &output).unwrap();
        run(Commands::Flush, &settings, &output).unwrap();
        assert!(!settings.store.join("index.json").exists());
    }

    #[test]
    fn test_extract_command() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(&temp_dir);
        let output = OutputWriter::new(true);

        let store = settings.open_store().unwrap();
        store
            .add_artifact(
                &Context::background(),
                &FileArtifact::from_bytes("out.txt", b"payload".to_vec()),
                "payload:v1",
            )
            .unwrap();

        let dest = temp_dir.path().join("dest");
        run(
            Commands::Extract {
                reference: "payload:v1".to_string(),
                dest: dest.clone(),
            },
            &settings,
            &output,
        )
        .unwrap();
        assert_eq!(std::fs::read(dest.join("out.txt")).unwrap(), b"payload");
    }

    #[test]
    fn test_flush_missing_store_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(&temp_dir);
        let output = OutputWriter::new(true);

        run(Commands::Flush, &settings, &output).unwrap();
        assert!(!settings.store.exists());
    }

    #[test]
    fn test_load_artifact_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("Notes.md");
        std::fs::write(&file, b"# notes").unwrap();

        let (artifact, reference) = load_artifact(AddCommands::File {
            path: file,
            reference: None,
            name: None,
        })
        .unwrap();
        assert_eq!(artifact.kind(), "file");
        assert_eq!(reference, "notes.md:latest");

        let missing = load_artifact(AddCommands::Chart {
            path: temp_dir.path().join("absent.tgz"),
            reference: None,
        });
        assert!(missing.is_err());
    }

    #[test]
    fn test_parse_registry_commands() {
        let cli = Cli::try_parse_from(["ocistash", "push", "localhost:5000", "--plain-http"]).unwrap();
        match cli.command {
            Commands::Push {
                registry,
                plain_http,
            } => {
                assert_eq!(registry, "localhost:5000");
                assert!(plain_http);
            }
            _ => panic!("expected push"),
        }

        let cli = Cli::try_parse_from([
            "ocistash", "pull", "ghcr.io/org/app:v1", "--ref", "app:v1",
        ])
        .unwrap();
        match cli.command {
            Commands::Pull {
                remote,
                reference,
                plain_http,
            } => {
                assert_eq!(remote, "ghcr.io/org/app:v1");
                assert_eq!(reference.as_deref(), Some("app:v1"));
                assert!(!plain_http);
            }
            _ => panic!("expected pull"),
        }
        assert!(Cli::try_parse_from(["ocistash", "push"]).is_err());
    }

    #[test]
    fn test_missing_reference_fails() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(&temp_dir);
        let output = OutputWriter::new(true);
        let err = run(
            Commands::Info {
                reference: "nothing:here".to_string(),
            },
            &settings,
            &output,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("nothing:here"));
    }
}
