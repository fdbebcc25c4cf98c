use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Well-known collection names used by the services.
pub mod collections {
    /// Workflow metadata (never bodies; see the engine's registry docs).
    pub const WORKFLOWS: &str = "workflows";
    /// Job metadata snapshots for restart reporting.
    pub const JOBS: &str = "jobs";
    /// Egress resources with health counters and assignment state.
    pub const RESOURCES: &str = "resources";
    /// Identities with bound resource, category, and metrics.
    pub const IDENTITIES: &str = "identities";
    /// Terminated sessions, for audit.
    pub const SESSION_HISTORY: &str = "session-history";
    /// Campaign records with their final batch outcomes.
    pub const CAMPAIGNS: &str = "campaigns";
}

/// File-backed key/record store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: &str, key: &str) -> Result<PathBuf> {
        validate_component(collection)?;
        validate_component(key)?;
        Ok(self.root.join(collection).join(format!("{key}.json")))
    }

    /// Write (or overwrite) one record.
    pub fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let path = self.record_path(collection, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create collection dir: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open record: {}", path.display()))?;

        acquire_flock(&file)?;
        let json = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
        file.set_len(0)
            .with_context(|| format!("Failed to truncate record: {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(&file);
        writer.seek(std::io::SeekFrom::Start(0))?;
        writer
            .write_all(json.as_bytes())
            .with_context(|| format!("Failed to write record: {}", path.display()))?;
        writer.flush()?;
        release_flock(&file);
        Ok(())
    }

    /// Read one record, or `None` if it does not exist.
    pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        let path = self.record_path(collection, key)?;
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)
            .with_context(|| format!("Failed to open record: {}", path.display()))?;
        acquire_flock(&file)?;
        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        reader.read_to_string(&mut contents)?;
        release_flock(&file);
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse record: {}", path.display()))?;
        Ok(Some(value))
    }

    /// List every record in a collection.
    ///
    /// Corrupt files are skipped with a warning; recovery should surface
    /// as much state as it can rather than fail on one bad record.
    pub fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        validate_component(collection)?;
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read collection dir: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        // Deterministic order for callers that iterate.
        entries.sort();

        let mut records = Vec::with_capacity(entries.len());
        for path in entries {
            let contents = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(err) => {
                    warn!(path = %path.display(), %err, "Skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_str(&contents) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), %err, "Skipping corrupt record");
                }
            }
        }
        Ok(records)
    }

    /// Remove one record. Returns `false` if it did not exist.
    pub fn remove(&self, collection: &str, key: &str) -> Result<bool> {
        let path = self.record_path(collection, key)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove record: {}", path.display()))?;
        Ok(true)
    }
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Store path component must not be empty");
    }
    if name.contains('/') || name.contains("..") {
        bail!("Store path component '{}' must not contain '/' or '..'", name);
    }
    Ok(())
}

fn acquire_flock(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid file descriptor from an open File.
    // LOCK_EX requests an exclusive blocking lock.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if ret != 0 {
        bail!(
            "Failed to acquire record lock: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn release_flock(file: &File) {
    let fd = file.as_raw_fd();
    // SAFETY: fd is valid; LOCK_UN releases the advisory lock.
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
}
