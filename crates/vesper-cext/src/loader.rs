//! Dynamic loading of extension modules.
//!
//! Extension modules are ordinary shared libraries located through the
//! configured search paths and loaded with `libloading`. A loaded library
//! is never unloaded: handles, type structs and function pointers handed
//! out by the module stay valid for the process's life.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use vesper_config::LoaderConfig;

/// Library loading errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Module file not found in any search path.
    ModuleNotFound(String),
    /// Symbol not found in a loaded module.
    SymbolNotFound { module: String, symbol: String },
    /// The platform loader rejected the file.
    LoadFailed(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::ModuleNotFound(name) => write!(f, "Extension module not found: {name}"),
            LoadError::SymbolNotFound { module, symbol } => {
                write!(f, "Symbol '{symbol}' not found in module '{module}'")
            }
            LoadError::LoadFailed(msg) => write!(f, "Failed to load module: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// One loaded extension library.
///
/// Kept behind `Arc` so the registry of loaded modules and the module
/// objects built from them can share ownership; dropping the last owner
/// would unload code whose pointers are still installed in type structs.
#[derive(Debug)]
pub struct LoadedLibrary {
    name: String,
    path: PathBuf,
    library: Library,
}

impl LoadedLibrary {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of an exported symbol, or `None` when absent.
    ///
    /// # Safety
    ///
    /// The caller must only use the address through the symbol's actual
    /// signature, and only while the library stays loaded.
    pub unsafe fn symbol_address(&self, symbol: &str) -> Option<*const ()> {
        let encoded = CString::new(symbol).ok()?;
        self.library
            .get::<unsafe extern "C" fn()>(encoded.as_bytes_with_nul())
            .ok()
            .map(|sym| *sym as usize as *const ())
    }

    /// Like [`LoadedLibrary::symbol_address`], but absence is an error.
    ///
    /// # Safety
    ///
    /// Same requirements as [`LoadedLibrary::symbol_address`].
    pub unsafe fn require_symbol(&self, symbol: &str) -> Result<*const (), LoadError> {
        self.symbol_address(symbol)
            .ok_or_else(|| LoadError::SymbolNotFound {
                module: self.name.clone(),
                symbol: symbol.to_string(),
            })
    }
}

/// Locates and loads extension libraries, caching by resolved path.
pub struct ExtensionLoader {
    loaded: HashMap<PathBuf, Arc<LoadedLibrary>>,
    search_paths: Vec<PathBuf>,
}

impl ExtensionLoader {
    /// Creates a loader searching the configured paths first, then the
    /// platform defaults.
    pub fn new(config: &LoaderConfig) -> ExtensionLoader {
        let mut search_paths: Vec<PathBuf> =
            config.search_paths.iter().map(PathBuf::from).collect();
        search_paths.extend(Self::default_search_paths());
        ExtensionLoader {
            loaded: HashMap::new(),
            search_paths,
        }
    }

    /// Platform default search paths, current directory first.
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{system_root}\\System32")));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Resolves a module name to a library file.
    ///
    /// Extension modules are usually named after the module without a
    /// `lib` prefix, so the bare form is tried before the prefixed one:
    /// - Linux: `{name}.so`, `lib{name}.so`
    /// - macOS: `{name}.dylib`, `{name}.so`, prefixed forms after
    /// - Windows: `{name}.dll`
    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() && direct.exists() {
            return Some(direct.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &[""]
        } else {
            &["", "lib"]
        };

        for search_path in &self.search_paths {
            for prefix in prefixes {
                for ext in extensions {
                    let candidate = search_path.join(format!("{prefix}{name}.{ext}"));
                    if candidate.exists() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    /// Loads a module library by name or absolute path, reusing the cached
    /// instance for a path loaded before.
    ///
    /// Loading executes the library's initialization code in-process; the
    /// caller vouches for the file.
    pub fn load(&mut self, name: &str) -> Result<Arc<LoadedLibrary>, LoadError> {
        let path = self
            .resolve_path(name)
            .ok_or_else(|| LoadError::ModuleNotFound(name.to_string()))?;
        if let Some(existing) = self.loaded.get(&path) {
            return Ok(existing.clone());
        }
        let library =
            unsafe { Library::new(&path).map_err(|e| LoadError::LoadFailed(e.to_string()))? };
        let loaded = Arc::new(LoadedLibrary {
            name: module_name_of(name, &path),
            path: path.clone(),
            library,
        });
        self.loaded.insert(path, loaded.clone());
        Ok(loaded)
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

/// The module name for a load request: the request itself when it was a
/// bare name, otherwise the file stem.
fn module_name_of(request: &str, path: &Path) -> String {
    if Path::new(request).is_absolute() {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.to_string())
    } else {
        request.to_string()
    }
}
