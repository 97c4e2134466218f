//! On-disk patch cache
//!
//! Compiled programs keyed by a hash of the serialized source body and the
//! crate version, so a host that replays the same patch set across restarts
//! skips recompilation. Entries that fail to deserialize (truncated writes,
//! format drift from an older build) are evicted on read instead of being
//! reported as errors; the cache is an accelerator, never a correctness
//! dependency.

use crate::emit::Program;
use crate::error::Result;
use crate::il::MethodBody;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub enabled: bool,
    /// Entries older than this are treated as absent and removed
    pub max_age: Option<Duration>,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        CacheConfig {
            cache_dir: cache_dir.into(),
            enabled: true,
            max_age: None,
        }
    }
}

/// A directory of compiled-program snapshots
pub struct PatchCache {
    config: CacheConfig,
}

impl PatchCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.enabled {
            fs::create_dir_all(&config.cache_dir)?;
        }
        Ok(PatchCache { config })
    }

    /// Look up the compiled form of `body`, if a current snapshot exists.
    pub fn load(&self, body: &MethodBody) -> Option<Program> {
        if !self.config.enabled {
            return None;
        }
        let path = self.entry_path(body)?;
        if self.expired(&path) {
            let _ = fs::remove_file(&path);
            return None;
        }
        let bytes = fs::read(&path).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(program) => {
                debug!(method = %body.name, path = %path.display(), "cache hit");
                Some(program)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "evicting corrupt cache entry");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Snapshot a compiled program for `body`.
    pub fn store(&self, body: &MethodBody, program: &Program) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(path) = self.entry_path(body) else {
            return Ok(());
        };
        let bytes = bincode::serialize(program)
            .map_err(|e| crate::error::Error::InternalError(format!("cache encode: {}", e)))?;
        fs::write(&path, bytes)?;
        debug!(method = %body.name, bytes = path.metadata().map(|m| m.len()).unwrap_or(0), "cached");
        Ok(())
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        if !self.config.cache_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.config.cache_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "patch") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn entry_path(&self, body: &MethodBody) -> Option<PathBuf> {
        let key = cache_key(body)?;
        Some(self.config.cache_dir.join(format!("{:016x}.patch", key)))
    }

    fn expired(&self, path: &Path) -> bool {
        let Some(max_age) = self.config.max_age else {
            return false;
        };
        path.metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > max_age)
    }
}

/// Hash of the serialized body plus the crate version, so a new build never
/// reuses an old build's encoding
fn cache_key(body: &MethodBody) -> Option<u64> {
    let bytes = bincode::serialize(body).ok()?;
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(&bytes);
    hasher.write(env!("CARGO_PKG_VERSION").as_bytes());
    Some(hasher.finish())
}
