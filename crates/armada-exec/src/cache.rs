use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use armada_core::{ChangesetSpec, Fingerprint};

/// Content-addressed store of previously computed changeset specs. A miss is
/// `Ok(None)`, never an error. Implementations must tolerate concurrent
/// access from many tasks; two tasks with the same key may both compute and
/// the last `set` wins.
#[async_trait]
pub trait ExecutionCache: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<Option<ChangesetSpec>>;
    async fn set(&self, key: &Fingerprint, spec: &ChangesetSpec) -> Result<()>;
    async fn clear(&self, key: &Fingerprint) -> Result<()>;
}

/// Cache that never hits. Used when no cache directory is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl ExecutionCache for NoopCache {
    async fn get(&self, _key: &Fingerprint) -> Result<Option<ChangesetSpec>> {
        Ok(None)
    }

    async fn set(&self, _key: &Fingerprint, _spec: &ChangesetSpec) -> Result<()> {
        Ok(())
    }

    async fn clear(&self, _key: &Fingerprint) -> Result<()> {
        Ok(())
    }
}

/// Flat on-disk cache: one JSON file per fingerprint under `dir`.
#[derive(Clone, Debug)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_hex()))
    }
}

#[async_trait]
impl ExecutionCache for DiskCache {
    async fn get(&self, key: &Fingerprint) -> Result<Option<ChangesetSpec>> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read cache entry {}", path.display())),
        };
        let spec = serde_json::from_slice(&bytes)
            .with_context(|| format!("decode cache entry {}", path.display()))?;
        debug!(key = key.as_hex(), "cache hit");
        Ok(Some(spec))
    }

    async fn set(&self, key: &Fingerprint, spec: &ChangesetSpec) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cache dir {}", self.dir.display()))?;

        // Write-temp-and-rename so concurrent readers never see a partial
        // entry.
        let path = self.entry_path(key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("create cache temp file")?;
        tmp.write_all(&serde_json::to_vec(spec).context("encode cache entry")?)?;
        tmp.persist(&path)
            .with_context(|| format!("persist cache entry {}", path.display()))?;
        debug!(key = key.as_hex(), "cache entry written");
        Ok(())
    }

    async fn clear(&self, key: &Fingerprint) -> Result<()> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove cache entry {}", path.display())),
        }
    }
}
