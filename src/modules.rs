//! Discovery and activation of handler modules.
//!
//! Handler code may ship in modules that sit next to the function binary
//! rather than being referenced by it. Before the pipeline is built the
//! endpoint scans the module directory, reads each module's identity and
//! activates it in an [`ExtensionRegistry`], so handler discovery can see the
//! handlers it provides.
//!
//! Modules published by the hosting runtime itself are recognised by their
//! [`PublisherToken`] and skipped: they are already present and must not be
//! registered a second time.
//!
//! ## Components
//!
//! - [`ModuleLoader`]: directory scan and runtime filtering
//! - [`ModuleInspector`]: reads a module's [`ModuleIdentity`]
//!   ([`ManifestInspector`] by default)
//! - [`ExtensionRegistry`]: activates a module
//!   ([`HandlerCatalog`] by default)
//!
//! Rust has no safe equivalent of loading foreign handler types out of an
//! arbitrary binary. Modules are therefore linked in and registered with the
//! catalog at startup, and loading a module from the directory is what makes
//! its handlers active.

mod catalog;
mod manifest;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use hex::FromHex;
use serde::Deserialize;
use tracing::debug;
use tracing_error::SpanTrace;

pub use catalog::HandlerCatalog;
pub use manifest::ManifestInspector;

/// Identity fingerprint of a module's publisher.
///
/// Eight bytes, written as sixteen hex digits. Parsing accepts either case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct PublisherToken([u8; 8]);

impl PublisherToken {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl FromStr for PublisherToken {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 8]>::from_hex(s.trim())
            .map(Self)
            .map_err(|_| ModuleError::new(ModuleErrorKind::InvalidToken(s.to_owned())))
    }
}

impl TryFrom<String> for PublisherToken {
    type Error = ModuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for PublisherToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Publisher tokens of modules owned by the hosting runtime.
const HOST_RUNTIME_TOKENS: [PublisherToken; 11] = [
    PublisherToken([0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89]),
    PublisherToken([0x7c, 0xec, 0x85, 0xd7, 0xbe, 0xa7, 0x79, 0x8e]),
    PublisherToken([0xb0, 0x3f, 0x5f, 0x7f, 0x11, 0xd5, 0x0a, 0x3a]),
    PublisherToken([0x31, 0xbf, 0x38, 0x56, 0xad, 0x36, 0x4e, 0x35]),
    PublisherToken([0xcc, 0x7b, 0x13, 0xff, 0xcd, 0x2d, 0xdd, 0x51]),
    PublisherToken([0xad, 0xb9, 0x79, 0x38, 0x29, 0xdd, 0xae, 0x60]),
    PublisherToken([0x7e, 0x34, 0x16, 0x7d, 0xcc, 0x6d, 0x6d, 0x8c]),
    PublisherToken([0x23, 0xec, 0x7f, 0xc2, 0xd6, 0xea, 0xa4, 0xa5]),
    PublisherToken([0x50, 0xce, 0xbf, 0x1c, 0xce, 0xb9, 0xd0, 0x5e]),
    PublisherToken([0x30, 0xad, 0x4f, 0xe6, 0xb2, 0xa6, 0xae, 0xed]),
    PublisherToken([0x9f, 0xc3, 0x86, 0x47, 0x9f, 0x8a, 0x22, 0x6c]),
];

/// Allow-list of runtime-owned publisher tokens.
#[derive(Clone, Debug)]
pub struct RuntimeTokens(HashSet<PublisherToken>);

impl RuntimeTokens {
    /// An allow-list that skips nothing.
    pub fn empty() -> Self {
        Self(HashSet::new())
    }

    pub fn contains(&self, token: &PublisherToken) -> bool {
        self.0.contains(token)
    }

    pub fn with_token(mut self, token: PublisherToken) -> Self {
        self.0.insert(token);
        self
    }
}

impl Default for RuntimeTokens {
    fn default() -> Self {
        Self(HOST_RUNTIME_TOKENS.into_iter().collect())
    }
}

/// What a module says about itself.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModuleIdentity {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub publisher_token: Option<PublisherToken>,
    /// Message types the module provides handlers for.
    #[serde(default)]
    pub handlers: Vec<String>,
}

/// Reads identity metadata from a module file.
pub trait ModuleInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ModuleIdentity, ModuleError>;
}

/// Makes a discovered module's handlers available to the pipeline.
///
/// Loading the same module twice must be harmless.
pub trait ExtensionRegistry: Send + Sync {
    fn load(&self, path: &Path, identity: &ModuleIdentity) -> Result<(), ModuleError>;
}

/// Outcome of one directory scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Scans a module directory and activates every non-runtime module found.
#[derive(Clone)]
pub struct ModuleLoader {
    inspector: Arc<dyn ModuleInspector>,
    runtime_tokens: RuntimeTokens,
    extension: String,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self {
            inspector: Arc::new(ManifestInspector),
            runtime_tokens: RuntimeTokens::default(),
            extension: std::env::consts::DLL_EXTENSION.to_owned(),
        }
    }
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inspector(mut self, inspector: impl ModuleInspector + 'static) -> Self {
        self.inspector = Arc::new(inspector);
        self
    }

    pub fn with_runtime_tokens(mut self, tokens: RuntimeTokens) -> Self {
        self.runtime_tokens = tokens;
        self
    }

    /// File extension of candidate modules. Defaults to the platform's
    /// dynamic library extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Scan `directory` (not recursively) and load each candidate module into
    /// `registry`.
    ///
    /// A module that cannot be inspected or loaded is logged and recorded in
    /// [`LoadReport::failed`]; the scan carries on with the rest. Only a
    /// directory that cannot be read fails the whole scan.
    #[tracing::instrument(skip(self, directory, registry), fields(directory = %directory.display()))]
    pub fn load(
        &self,
        directory: &Path,
        registry: &dyn ExtensionRegistry,
    ) -> Result<LoadReport, ModuleError> {
        let entries = std::fs::read_dir(directory).map_err(|e| {
            ModuleError::new(ModuleErrorKind::Io {
                path: directory.to_path_buf(),
                source: e,
            })
        })?;

        let candidates = self.candidates(entries.map(|entry| entry.map(|entry| entry.path())));

        let mut report = LoadReport::default();
        for path in candidates {
            let identity = match self.inspector.inspect(&path) {
                Ok(identity) => identity,
                Err(error) => {
                    debug!(
                        ?path,
                        %error,
                        "Failed to read module identity, ignore if the module is not needed by this function"
                    );
                    report.failed.push(path);
                    continue;
                }
            };

            if identity
                .publisher_token
                .is_some_and(|token| self.runtime_tokens.contains(&token))
            {
                debug!(?path, module = %identity.name, "Skipping runtime module");
                report.skipped.push(path);
                continue;
            }

            match registry.load(&path, &identity) {
                Ok(()) => {
                    debug!(?path, module = %identity.name, "Module loaded");
                    report.loaded.push(path);
                }
                Err(error) => {
                    debug!(
                        ?path,
                        %error,
                        "Failed to load module, ignore if the module is not needed by this function"
                    );
                    report.failed.push(path);
                }
            }
        }

        Ok(report)
    }

    /// Module files among `entries`, sorted. Entries that cannot be read are
    /// logged and left out.
    fn candidates(
        &self,
        entries: impl IntoIterator<Item = std::io::Result<PathBuf>>,
    ) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(error) => {
                    debug!(%error, "Failed to read module directory entry");
                    None
                }
            })
            .filter(|path| path.is_file() && self.is_candidate(path))
            .collect();
        candidates.sort();
        candidates
    }

    fn is_candidate(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

/// Error returned by module discovery and loading.
#[derive(Debug)]
pub struct ModuleError {
    context: SpanTrace,
    kind: ModuleErrorKind,
}

/// Module error kinds.
#[derive(Debug)]
pub enum ModuleErrorKind {
    /// A file or directory could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A module manifest is not valid.
    Manifest {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A publisher token is not sixteen hex digits.
    InvalidToken(String),
    /// The module is not linked into this binary.
    UnknownModule(String),
    /// The module declares handlers the linked-in module does not provide.
    MissingHandlers {
        module: String,
        message_types: Vec<String>,
    },
}

impl ModuleError {
    pub(crate) fn new(kind: ModuleErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ModuleErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ModuleErrorKind::Io { path, source } => {
                writeln!(f, "Module error: {}: {source}", path.display())
            }
            ModuleErrorKind::Manifest { path, source } => {
                writeln!(f, "Module error: invalid manifest {}: {source}", path.display())
            }
            ModuleErrorKind::InvalidToken(token) => {
                writeln!(f, "Module error: invalid publisher token {token:?}")
            }
            ModuleErrorKind::UnknownModule(name) => {
                writeln!(f, "Module error: module {name} is not registered")
            }
            ModuleErrorKind::MissingHandlers {
                module,
                message_types,
            } => writeln!(
                f,
                "Module error: module {module} has no handlers for {}",
                message_types.join(", ")
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ModuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ModuleErrorKind::Io { source, .. } => Some(source),
            ModuleErrorKind::Manifest { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing::level_filters::LevelFilter;

    use super::*;
    use crate::logging::capture::CapturedLogs;

    const DLL: &str = std::env::consts::DLL_EXTENSION;

    #[derive(Default)]
    struct RecordingRegistry {
        loaded: Mutex<Vec<String>>,
    }

    impl ExtensionRegistry for RecordingRegistry {
        fn load(&self, _path: &Path, identity: &ModuleIdentity) -> Result<(), ModuleError> {
            if identity.name == "broken" {
                return Err(ModuleError::new(ModuleErrorKind::UnknownModule(
                    identity.name.clone(),
                )));
            }
            self.loaded.lock().unwrap().push(identity.name.clone());
            Ok(())
        }
    }

    fn write_module(dir: &Path, stem: &str, manifest: &str) -> PathBuf {
        let binary = dir.join(format!("{stem}.{DLL}"));
        std::fs::write(&binary, b"\x7fELF").unwrap();
        std::fs::write(dir.join(format!("{stem}.toml")), manifest).unwrap();
        binary
    }

    #[test]
    fn publisher_tokens_parse_case_insensitively() {
        let lower: PublisherToken = "b77a5c561934e089".parse().unwrap();
        let upper: PublisherToken = "B77A5C561934E089".parse().unwrap();

        assert_eq!(lower, upper);
        assert_eq!(upper.to_string(), "b77a5c561934e089");
        assert!(RuntimeTokens::default().contains(&upper));
        assert!("b77a5c".parse::<PublisherToken>().is_err());
        assert!("zz7a5c561934e089".parse::<PublisherToken>().is_err());
    }

    #[test]
    fn runtime_modules_are_not_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = write_module(
            tmp.path(),
            "host.runtime",
            "name = \"host.runtime\"\npublisher_token = \"9FC386479F8A226C\"\n",
        );
        let handlers = write_module(
            tmp.path(),
            "orders",
            "name = \"orders\"\npublisher_token = \"0123456789abcdef\"\n",
        );

        let registry = RecordingRegistry::default();
        let report = ModuleLoader::new().load(tmp.path(), &registry).unwrap();

        assert_eq!(*registry.loaded.lock().unwrap(), vec!["orders".to_owned()]);
        assert_eq!(report.loaded, vec![handlers]);
        assert_eq!(report.skipped, vec![runtime]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn unreadable_modules_do_not_abort_the_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let good = write_module(tmp.path(), "billing", "name = \"billing\"\n");
        let corrupt = write_module(tmp.path(), "corrupt", "name = [not toml");
        let orphan = tmp.path().join(format!("orphan.{DLL}"));
        std::fs::write(&orphan, b"no manifest").unwrap();
        let rejected = write_module(tmp.path(), "broken", "name = \"broken\"\n");

        let registry = RecordingRegistry::default();
        let report = ModuleLoader::new().load(tmp.path(), &registry).unwrap();

        assert_eq!(report.loaded, vec![good]);
        assert_eq!(report.failed, vec![rejected, corrupt, orphan]);
        assert_eq!(*registry.loaded.lock().unwrap(), vec!["billing".to_owned()]);
    }

    #[test]
    fn scan_is_not_recursive_and_ignores_other_files() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        write_module(&nested, "deep", "name = \"deep\"\n");
        std::fs::write(tmp.path().join("readme.txt"), "hello").unwrap();

        let registry = RecordingRegistry::default();
        let report = ModuleLoader::new().load(tmp.path(), &registry).unwrap();

        assert_eq!(report, LoadReport::default());
    }

    #[test]
    fn extension_matching_ignores_case() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Shipping.DLL"), b"").unwrap();
        std::fs::write(tmp.path().join("Shipping.toml"), "name = \"shipping\"\n").unwrap();

        let registry = RecordingRegistry::default();
        let report = ModuleLoader::new()
            .with_extension("dll")
            .load(tmp.path(), &registry)
            .unwrap();

        assert_eq!(report.loaded.len(), 1);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let registry = RecordingRegistry::default();
        let err = ModuleLoader::new()
            .load(Path::new("/nonexistent/bin"), &registry)
            .unwrap_err();

        assert!(matches!(err.kind(), ModuleErrorKind::Io { .. }));
    }

    #[test]
    fn unreadable_directory_entries_are_logged_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let module = tmp.path().join(format!("orders.{DLL}"));
        std::fs::write(&module, b"").unwrap();

        let logs = CapturedLogs::default();
        let candidates = tracing::dispatcher::with_default(&logs.dispatch(LevelFilter::DEBUG), || {
            ModuleLoader::new().candidates(vec![
                Err(std::io::Error::other("stale file handle")),
                Ok(module.clone()),
            ])
        });

        assert_eq!(candidates, vec![module]);
        assert!(logs.contents().contains("stale file handle"));
    }
}
