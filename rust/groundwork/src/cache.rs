//! Local provider plugin cache.
//!
//! Layout: `<root>/<hostname>/<namespace>/<type>/<version>/<binary>`. The
//! registry client that populates the cache lives outside the engine; the
//! engine only resolves binaries, verifies them against the dependency
//! lock, and guards the directory with a cross-process advisory lock.

use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::deplock::LockFile;

pub struct ProviderCache {
    root: PathBuf,
}

impl ProviderCache {
    pub fn new(root: impl Into<PathBuf>) -> ProviderCache {
        ProviderCache { root: root.into() }
    }

    /// The default cache under the user's home directory.
    pub fn default_location() -> ProviderCache {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        ProviderCache::new(PathBuf::from(home).join(".groundwork.d").join("providers"))
    }

    fn version_dir(&self, source: &str, version: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for part in source.split('/') {
            dir.push(part);
        }
        dir.push(version);
        dir
    }

    /// The provider executable for a cached source/version, if present.
    pub fn resolve(&self, source: &str, version: &str) -> Option<PathBuf> {
        let dir = self.version_dir(source, version);
        let entries = std::fs::read_dir(&dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_file())
    }

    /// Resolves and verifies the binary's digest against the dependency
    /// lock. Installation fails when the hash is not in the locked set.
    pub fn resolve_verified(
        &self,
        lock: &LockFile,
        source: &str,
        version: &str,
    ) -> Result<PathBuf> {
        let path = self
            .resolve(source, version)
            .with_context(|| format!("provider {} {} is not in the cache", source, version))?;
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading cached provider {}", path.display()))?;
        lock.verify(source, &bytes)
            .with_context(|| format!("verifying cached provider {}", source))?;
        Ok(path)
    }

    /// Copies a provider binary into the cache. Used by mirrors and tests;
    /// the registry client goes through the same path.
    pub fn install(&self, source: &str, version: &str, binary: &FsPath) -> Result<PathBuf> {
        let _guard = self.lock_dir()?;
        let dir = self.version_dir(source, version);
        std::fs::create_dir_all(&dir)?;
        let file_name = binary
            .file_name()
            .context("provider binary has no file name")?;
        let dest = dir.join(file_name);
        std::fs::copy(binary, &dest)
            .with_context(|| format!("installing provider into {}", dest.display()))?;
        Ok(dest)
    }

    /// Cross-process advisory lock on the cache directory. Blocks until
    /// acquired, logging while another process holds it.
    pub fn lock_dir(&self) -> Result<CacheDirGuard> {
        std::fs::create_dir_all(&self.root)?;
        let lock_path = self.root.join(".lock");
        let deadline = std::time::Instant::now() + Duration::from_secs(60);
        let mut warned = false;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut f) => {
                    use std::io::Write as _;
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(CacheDirGuard { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !warned {
                        tracing::info!("waiting for the provider cache lock");
                        warned = true;
                    }
                    if std::time::Instant::now() > deadline {
                        bail!(
                            "timed out waiting for the provider cache lock at {}",
                            lock_path.display()
                        );
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Releases the cache lock on drop.
pub struct CacheDirGuard {
    path: PathBuf,
}

impl Drop for CacheDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
