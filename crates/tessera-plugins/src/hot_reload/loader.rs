//! Plugin module loader
//!
//! Maps plugin libraries into the process. Each library is first copied to
//! a versioned shadow file so the original can be rebuilt while the old
//! image is still mapped. Unloaded images are parked in a graveyard until
//! every object constructed by their generation has been dropped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use error_stack::Report;
use libloading::Library;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use tessera_kernel::Generation;

use crate::host::{ENTRY_SYMBOL, PluginEntryFn};

/// Plugin load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PluginLoadError {
    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Not a native plugin: {path} ({kind})")]
    InvalidPlugin { path: PathBuf, kind: PluginKind },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Plugin not found: {0}")]
    NotFound(String),
}

pub type PluginLoadResult<T> = Result<T, PluginLoadError>;

/// Result alias with context-carrying reports
pub type PluginLoadReport<T> = Result<T, Report<PluginLoadError>>;

/// Lift a [`PluginLoadResult`] into a [`PluginLoadReport`]
pub trait IntoPluginLoadReport<T> {
    fn into_report(self) -> PluginLoadReport<T>;
}

impl<T> IntoPluginLoadReport<T> for PluginLoadResult<T> {
    #[inline]
    fn into_report(self) -> PluginLoadReport<T> {
        self.map_err(Report::new)
    }
}

// ============================================================================
// Plugin kinds
// ============================================================================

/// What a candidate plugin file contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Invalid,
    /// Native library exporting the plugin entry point
    Native,
    /// CLI assembly for a managed runtime
    Managed,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::Invalid => "invalid",
            PluginKind::Native => "native",
            PluginKind::Managed => "managed",
        };
        f.write_str(name)
    }
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const PE_MAGIC: &[u8] = b"MZ";
const MACHO_MAGICS: [[u8; 4]; 4] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
];
/// CLI metadata root signature
const CLI_SIGNATURE: &[u8] = b"BSJB";

impl PluginKind {
    /// Classify a file by its contents
    pub fn inspect(path: impl AsRef<Path>) -> PluginLoadResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        Ok(Self::classify(&bytes))
    }

    pub fn classify(bytes: &[u8]) -> Self {
        let is_pe = bytes.starts_with(PE_MAGIC);
        let is_binary = is_pe
            || bytes.starts_with(ELF_MAGIC)
            || MACHO_MAGICS.iter().any(|magic| bytes.starts_with(magic));
        if !is_binary {
            return Self::Invalid;
        }

        let symbol = &ENTRY_SYMBOL[..ENTRY_SYMBOL.len() - 1];
        if contains(bytes, symbol) {
            Self::Native
        } else if is_pe && contains(bytes, CLI_SIGNATURE) {
            Self::Managed
        } else {
            Self::Invalid
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

// ============================================================================
// Module images
// ============================================================================

/// Code image a module runs from
pub trait ModuleImage: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// File the image was loaded from, if any
    fn source_path(&self) -> Option<&Path>;

    /// Content hash used for change detection
    fn hash(&self) -> &str;

    /// Entry point; valid while the image is alive
    fn entry(&self) -> PluginEntryFn;
}

/// Shared library mapped from a shadow copy
pub struct PluginLibrary {
    name: String,
    path: PathBuf,
    shadow_path: PathBuf,
    library: Option<Library>,
    entry: PluginEntryFn,
    hash: String,
    version: u64,
    loaded_at: Instant,
}

impl PluginLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shadow_path(&self) -> &Path {
        &self.shadow_path
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl ModuleImage for PluginLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn entry(&self) -> PluginEntryFn {
        self.entry
    }
}

impl fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("shadow_path", &self.shadow_path)
            .field("version", &self.version)
            .finish()
    }
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!(module = %self.name, error = %e, "Failed to close plugin library");
            }
        }
        if let Err(e) = fs::remove_file(&self.shadow_path) {
            debug!(path = ?self.shadow_path, error = %e, "Shadow copy not removed");
        }
        debug!(module = %self.name, version = self.version, "Unmapped plugin library");
    }
}

/// Image whose entry point is linked into the host
///
/// Used for plugins compiled into the executable and for tests.
#[derive(Debug, Clone)]
pub struct StaticImage {
    name: String,
    hash: String,
    entry: PluginEntryFn,
    source: Option<PathBuf>,
}

impl StaticImage {
    pub fn new(name: &str, entry: PluginEntryFn) -> Self {
        Self {
            name: name.to_string(),
            hash: format!("static:{name}"),
            entry,
            source: None,
        }
    }

    /// Override the hash, e.g. to simulate a rebuilt image
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// Tie the image to a file so change detection hashes it
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }
}

impl ModuleImage for StaticImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn entry(&self) -> PluginEntryFn {
        self.entry
    }
}

// ============================================================================
// Loader
// ============================================================================

enum ShadowDir {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl ShadowDir {
    fn path(&self) -> &Path {
        match self {
            ShadowDir::Temp(dir) => dir.path(),
            ShadowDir::Fixed(path) => path,
        }
    }
}

/// Image waiting for its generation's last object to go away
struct Retired {
    image: Arc<dyn ModuleImage>,
    generation: Weak<Generation>,
}

/// Plugin loader for mapping module images
pub struct PluginLoader {
    search_paths: Vec<PathBuf>,
    shadow_dir: ShadowDir,
    next_version: AtomicU64,
    graveyard: Mutex<Vec<Retired>>,
}

impl PluginLoader {
    /// Loader shadowing into a private temporary directory
    pub fn new() -> PluginLoadResult<Self> {
        let dir = tempfile::Builder::new().prefix("tessera-shadow-").tempdir()?;
        Ok(Self::with_shadow(ShadowDir::Temp(dir)))
    }

    /// Loader shadowing into `dir`, created if missing
    pub fn with_shadow_dir(dir: impl AsRef<Path>) -> PluginLoadResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self::with_shadow(ShadowDir::Fixed(dir.as_ref().to_path_buf())))
    }

    fn with_shadow(shadow_dir: ShadowDir) -> Self {
        Self {
            search_paths: Vec::new(),
            shadow_dir,
            next_version: AtomicU64::new(1),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn add_search_path<P: AsRef<Path>>(&mut self, path: P) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn shadow_dir(&self) -> &Path {
        self.shadow_dir.path()
    }

    /// SHA-256 of a file, hex encoded
    pub fn calculate_hash(path: &Path) -> PluginLoadResult<String> {
        let contents = fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Platform file name of a plugin library
    pub fn library_file_name(name: &str) -> String {
        format!("{}{}{}", std::env::consts::DLL_PREFIX, name, std::env::consts::DLL_SUFFIX)
    }

    /// Module name of a library path (file stem without the platform prefix)
    pub fn module_name(path: &Path) -> String {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        stem.strip_prefix(std::env::consts::DLL_PREFIX)
            .filter(|s| !s.is_empty())
            .unwrap_or(stem)
            .to_string()
    }

    /// Whether a path has the platform library extension
    pub fn is_library(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == std::env::consts::DLL_EXTENSION)
    }

    /// Find plugin file by name or path
    pub fn find_plugin(&self, name: &str) -> Option<PathBuf> {
        let direct_path = PathBuf::from(name);
        if direct_path.is_file() {
            return Some(direct_path);
        }

        let lib_name = Self::library_file_name(name);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&lib_name))
            .find(|path| path.is_file())
    }

    /// Map a plugin library through a fresh shadow copy
    ///
    /// # Safety
    ///
    /// Mapping a library runs its initializers, and the entry point is
    /// trusted to have the [`PluginEntryFn`] signature.
    pub unsafe fn load_library(&self, path: impl AsRef<Path>) -> PluginLoadResult<Arc<PluginLibrary>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PluginLoadError::NotFound(path.display().to_string()));
        }

        let kind = PluginKind::inspect(path)?;
        if kind != PluginKind::Native {
            return Err(PluginLoadError::InvalidPlugin {
                path: path.to_path_buf(),
                kind,
            });
        }

        let name = Self::module_name(path);
        let hash = Self::calculate_hash(path)?;
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let shadow_path = self.shadow_path(&name, version);
        fs::copy(path, &shadow_path)?;

        // SAFETY: forwarded to the caller.
        let library = match unsafe { Library::new(&shadow_path) } {
            Ok(library) => library,
            Err(e) => {
                let _ = fs::remove_file(&shadow_path);
                return Err(PluginLoadError::LibraryLoad(e.to_string()));
            }
        };

        // SAFETY: the symbol type is the documented entry signature.
        let entry = unsafe { library.get::<PluginEntryFn>(ENTRY_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|e| e.to_string());
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                drop(library);
                let _ = fs::remove_file(&shadow_path);
                return Err(PluginLoadError::SymbolNotFound(e));
            }
        };

        info!(module = %name, version, path = ?path, "Loaded plugin library");
        Ok(Arc::new(PluginLibrary {
            name,
            path: path.to_path_buf(),
            shadow_path,
            library: Some(library),
            entry,
            hash,
            version,
            loaded_at: Instant::now(),
        }))
    }

    fn shadow_path(&self, name: &str, version: u64) -> PathBuf {
        let file = format!(
            "{}{}-{}{}",
            std::env::consts::DLL_PREFIX,
            name,
            version,
            std::env::consts::DLL_SUFFIX
        );
        self.shadow_dir.path().join(file)
    }

    /// Whether the file behind an image differs from what was loaded
    pub fn has_changed(&self, image: &dyn ModuleImage) -> PluginLoadResult<bool> {
        match image.source_path() {
            Some(path) => Ok(Self::calculate_hash(path)? != image.hash()),
            None => Ok(false),
        }
    }

    /// Retire a generation and park its image until the generation is released
    pub fn retire(&self, image: Arc<dyn ModuleImage>, generation: &Arc<Generation>) {
        generation.retire();
        debug!(module = %image.name(), generation = generation.id(), "Retired generation");
        self.graveyard.lock().push(Retired {
            image,
            generation: Arc::downgrade(generation),
        });
    }

    /// Drop parked images whose generation has no live references
    pub fn collect_garbage(&self) -> usize {
        let released: Vec<Arc<dyn ModuleImage>> = {
            let mut graveyard = self.graveyard.lock();
            let (dead, alive): (Vec<_>, Vec<_>) = graveyard
                .drain(..)
                .partition(|retired| retired.generation.strong_count() == 0);
            *graveyard = alive;
            dead.into_iter().map(|retired| retired.image).collect()
        };

        let count = released.len();
        if count > 0 {
            debug!(count, "Released retired plugin images");
        }
        // Unmap outside the lock.
        drop(released);
        count
    }

    /// Images still waiting on live objects
    pub fn retired_count(&self) -> usize {
        self.graveyard.lock().len()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("search_paths", &self.search_paths)
            .field("shadow_dir", &self.shadow_dir.path())
            .field("retired", &self.retired_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;

    unsafe extern "C" fn noop_entry(_host: *mut HostContext, _op: u32) -> i32 {
        0
    }

    #[test]
    fn test_search_paths() {
        let mut loader = PluginLoader::new().unwrap();
        loader.add_search_path("/usr/lib/plugins");
        loader.add_search_path("/opt/plugins");
        assert_eq!(loader.search_paths().len(), 2);
        assert!(loader.shadow_dir().is_dir());
    }

    #[test]
    fn test_calculate_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.txt");
        std::fs::write(&file_path, b"test content").unwrap();

        let hash1 = PluginLoader::calculate_hash(&file_path).unwrap();
        let hash2 = PluginLoader::calculate_hash(&file_path).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);

        std::fs::write(&file_path, b"other content").unwrap();
        assert_ne!(PluginLoader::calculate_hash(&file_path).unwrap(), hash1);
    }

    #[test]
    fn test_classify() {
        let mut native = ELF_MAGIC.to_vec();
        native.extend_from_slice(b"\0\0tessera_plugin_main\0");
        assert_eq!(PluginKind::classify(&native), PluginKind::Native);

        let mut managed = PE_MAGIC.to_vec();
        managed.extend_from_slice(b"\0\0BSJB\0");
        assert_eq!(PluginKind::classify(&managed), PluginKind::Managed);

        assert_eq!(PluginKind::classify(ELF_MAGIC), PluginKind::Invalid);
        assert_eq!(PluginKind::classify(b"plain text tessera_plugin_main"), PluginKind::Invalid);
        assert_eq!(PluginKind::classify(&[]), PluginKind::Invalid);
    }

    #[test]
    fn test_load_rejects_non_native_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PluginLoader::library_file_name("fake"));
        std::fs::write(&path, b"not a library").unwrap();

        let loader = PluginLoader::with_shadow_dir(dir.path().join("shadow")).unwrap();
        let err = unsafe { loader.load_library(&path) }.unwrap_err();
        assert!(matches!(
            err,
            PluginLoadError::InvalidPlugin {
                kind: PluginKind::Invalid,
                ..
            }
        ));

        let missing = unsafe { loader.load_library(dir.path().join("missing.so")) }.unwrap_err();
        assert!(matches!(missing, PluginLoadError::NotFound(_)));
    }

    #[test]
    fn test_find_plugin_in_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PluginLoader::library_file_name("mover"));
        std::fs::write(&path, b"x").unwrap();

        let mut loader = PluginLoader::new().unwrap();
        assert!(loader.find_plugin("mover").is_none());
        loader.add_search_path(dir.path());
        assert_eq!(loader.find_plugin("mover"), Some(path.clone()));
        assert_eq!(PluginLoader::module_name(&path), "mover");
        assert!(PluginLoader::is_library(&path));
    }

    #[test]
    fn test_graveyard_waits_for_generation() {
        let loader = PluginLoader::new().unwrap();
        let image: Arc<dyn ModuleImage> = Arc::new(StaticImage::new("mover", noop_entry));
        let generation = Generation::new(1, "mover");
        let survivor = generation.clone();

        loader.retire(image.clone(), &generation);
        drop(generation);
        assert!(survivor.is_retired());
        assert_eq!(loader.collect_garbage(), 0);
        assert_eq!(loader.retired_count(), 1);

        drop(survivor);
        assert_eq!(loader.collect_garbage(), 1);
        assert_eq!(loader.retired_count(), 0);
        assert_eq!(Arc::strong_count(&image), 1);
    }

    #[test]
    fn test_static_image_never_changes() {
        let loader = PluginLoader::new().unwrap();
        let image = StaticImage::new("mover", noop_entry);
        assert_eq!(image.hash(), "static:mover");
        assert!(!loader.has_changed(&image).unwrap());
    }
}
