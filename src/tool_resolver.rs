//! # Tool Path Resolver
//!
//! Questo modulo trova gli eseguibili esterni (ffmpeg, gifski, Ghostscript,
//! jpegoptim, oxipng) nei diversi ambienti:
//! - Path esplicito configurato per il singolo tool
//! - Directory di tool bundled (`MEDIA_ENGINE_TOOLS_DIR` o configurata)
//! - Directory `tools/` accanto all'eseguibile
//! - System PATH
//!
//! I path risolti vengono memorizzati in cache. `invalidate()` rimuove una voce
//! così che il runner possa ri-risolvere un tool installato dopo l'avvio.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Environment variable pointing at a directory of bundled tools
pub const TOOLS_DIR_ENV: &str = "MEDIA_ENGINE_TOOLS_DIR";

/// Platform-specific executable name for a logical tool name
pub fn executable_name(tool: &str) -> String {
    if cfg!(windows) {
        match tool {
            // Ghostscript ships a console binary with a different name on Windows
            "gs" => "gswin64c.exe".to_string(),
            other => format!("{}.exe", other),
        }
    } else {
        tool.to_string()
    }
}

/// Resolves logical tool names to executable paths, with a cache
#[derive(Debug)]
pub struct ToolPathResolver {
    /// Explicit per-tool overrides from configuration
    overrides: HashMap<String, PathBuf>,
    /// Base directory where tools are bundled
    tools_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, PathBuf>>,
}

impl ToolPathResolver {
    /// Create a resolver using explicit overrides and an optional bundled tools dir.
    ///
    /// When `tools_dir` is `None` the resolver falls back to `MEDIA_ENGINE_TOOLS_DIR`
    /// and then to a `tools/` directory next to the running executable.
    pub fn new(overrides: HashMap<String, PathBuf>, tools_dir: Option<PathBuf>) -> Self {
        let tools_dir = tools_dir.or_else(Self::detect_bundled_tools_dir);
        Self {
            overrides,
            tools_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolver that only looks at the system PATH and the environment
    pub fn system() -> Self {
        Self::new(HashMap::new(), None)
    }

    fn detect_bundled_tools_dir() -> Option<PathBuf> {
        if let Ok(dir) = env::var(TOOLS_DIR_ENV) {
            let path = PathBuf::from(dir);
            if path.is_dir() {
                debug!("Found tools directory via {}: {:?}", TOOLS_DIR_ENV, path);
                return Some(path);
            }
        }

        let exe = env::current_exe().ok()?;
        let candidate = exe.parent()?.join("tools");
        if candidate.is_dir() {
            debug!("Found bundled tools directory: {:?}", candidate);
            return Some(candidate);
        }
        None
    }

    /// Resolve the path to a tool, using the cache when possible
    pub fn resolve(&self, tool: &str) -> Option<PathBuf> {
        if let Some(path) = self.lock_cache().get(tool) {
            return Some(path.clone());
        }

        let resolved = self.resolve_uncached(tool)?;
        debug!("Resolved tool {} -> {:?}", tool, resolved);
        self.lock_cache().insert(tool.to_string(), resolved.clone());
        Some(resolved)
    }

    /// Drop a cached location so the next `resolve` searches again
    pub fn invalidate(&self, tool: &str) {
        if self.lock_cache().remove(tool).is_some() {
            debug!("Invalidated cached location for {}", tool);
        }
    }

    /// Check if a specific tool is available
    pub fn is_available(&self, tool: &str) -> bool {
        self.resolve(tool).is_some()
    }

    fn resolve_uncached(&self, tool: &str) -> Option<PathBuf> {
        // Un override configurato vince sempre, anche se il file manca:
        // così l'errore riporta il path che l'utente si aspetta
        if let Some(path) = self.overrides.get(tool) {
            return Some(path.clone());
        }

        if let Some(ref tools_dir) = self.tools_dir {
            if let Some(path) = Self::bundled_tool_path(tools_dir, tool) {
                return Some(path);
            }
        }

        if let Some(path) = Self::find_in_system_path(tool) {
            return Some(path);
        }

        warn!("Tool not found: {}", tool);
        None
    }

    /// Look for `tools/<tool>` and `tools/<tool>/<tool>`
    fn bundled_tool_path(tools_dir: &Path, tool: &str) -> Option<PathBuf> {
        let name = executable_name(tool);
        [tools_dir.join(&name), tools_dir.join(tool).join(&name)]
            .into_iter()
            .find(|path| path.is_file())
    }

    /// Find tool in system PATH
    fn find_in_system_path(tool: &str) -> Option<PathBuf> {
        let name = executable_name(tool);
        let paths = env::var_os("PATH")?;
        env::split_paths(&paths)
            .map(|dir| dir.join(&name))
            .find(|path| path.is_file())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        // Un panic durante l'inserimento non lascia la mappa incoerente
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get installation instructions for a tool on Linux
    pub fn install_hint(tool: &str) -> String {
        match tool {
            "ffmpeg" | "ffprobe" => "sudo apt-get install ffmpeg".to_string(),
            "gs" => "sudo apt-get install ghostscript".to_string(),
            "gifski" => "cargo install gifski".to_string(),
            "jpegoptim" => "sudo apt-get install jpegoptim".to_string(),
            "oxipng" => "sudo apt-get install oxipng".to_string(),
            other => format!("sudo apt-get install {}", other),
        }
    }

    /// Human-readable availability report for the tools the engine drives
    pub fn tools_report(&self) -> String {
        let mut report = String::from("Tool availability:\n");
        for tool in ["ffmpeg", "gifski", "gs", "jpegoptim", "oxipng"] {
            match self.resolve(tool) {
                Some(path) => report.push_str(&format!("  ✅ {} -> {}\n", tool, path.display())),
                None => report.push_str(&format!(
                    "  ❌ {} (install with: {})\n",
                    tool,
                    Self::install_hint(tool)
                )),
            }
        }
        report
    }
}

impl Default for ToolPathResolver {
    fn default() -> Self {
        Self::system()
    }
}
