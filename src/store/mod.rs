// Data store - typed file manager for every on-disk document
//
// All config reads and writes in the core funnel through this module so
// the caching, atomic-write and permission rules live in exactly one
// place. Three encodings are supported: JSON, TOML (comment-preserving
// via toml_edit) and .env key=value files.
//
// Cache: keyed by path, invalidated by mtime mismatch on every read,
// bounded LRU eviction. Writes: parent dirs created, temp file + fsync +
// rename, chmod 0600 on unix.

mod env_file;

pub use env_file::{parse_env, render_env};

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use toml_edit::DocumentMut;

/// Maximum cached documents before LRU eviction kicks in.
const CACHE_CAPACITY: usize = 64;

struct CacheEntry {
    mtime: SystemTime,
    value: Value,
    /// Monotonic touch counter for LRU eviction
    last_used: u64,
}

/// Process-wide file manager. Cheap to clone via Arc at the call sites;
/// internally a single mutex guards the cache (reads are a quick mtime
/// stat + map lookup, never file I/O on a hit).
pub struct DataStore {
    cache: Mutex<(HashMap<PathBuf, CacheEntry>, u64)>,
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new((HashMap::new(), 0)),
        }
    }

    /// Read a JSON document through the cache. Returns `Value::Null` if the
    /// file does not exist.
    pub fn read_cached(&self, path: &Path) -> Result<Value> {
        let mtime = match fs::metadata(path) {
            Ok(meta) => meta.modified().context("file mtime unavailable")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Null),
            Err(e) => return Err(e).context(format!("stat {}", path.display())),
        };

        {
            let mut guard = self.cache.lock().unwrap();
            let (cache, counter) = &mut *guard;
            *counter += 1;
            if let Some(entry) = cache.get_mut(path) {
                if entry.mtime == mtime {
                    entry.last_used = *counter;
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = self.read_uncached(path)?;

        let mut guard = self.cache.lock().unwrap();
        let (cache, counter) = &mut *guard;
        if cache.len() >= CACHE_CAPACITY && !cache.contains_key(path) {
            // Evict the least recently used entry
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            path.to_path_buf(),
            CacheEntry {
                mtime,
                value: value.clone(),
                last_used: *counter,
            },
        );

        Ok(value)
    }

    /// Read a JSON document bypassing the cache. Missing file reads as Null.
    pub fn read_uncached(&self, path: &Path) -> Result<Value> {
        match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Value::Null),
            Ok(text) => {
                serde_json::from_str(&text).context(format!("parse json {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
            Err(e) => Err(e).context(format!("read {}", path.display())),
        }
    }

    /// Typed JSON read; missing file maps to `T::default()`.
    pub fn read_json<T>(&self, path: &Path) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let value = self.read_cached(path)?;
        if value.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(value).context(format!("decode {}", path.display()))
    }

    /// Serialize and atomically write a JSON document, then refresh the cache.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_value(value).context("encode json")?;
        let text = serde_json::to_string_pretty(&json).context("render json")?;
        self.write_atomic(path, text.as_bytes())?;
        self.refresh_cache(path, json);
        Ok(())
    }

    /// Read a TOML file as an editable document (comments preserved).
    /// Missing file yields an empty document.
    pub fn read_toml_document(&self, path: &Path) -> Result<DocumentMut> {
        match fs::read_to_string(path) {
            Ok(text) => text
                .parse::<DocumentMut>()
                .context(format!("parse toml {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DocumentMut::new()),
            Err(e) => Err(e).context(format!("read {}", path.display())),
        }
    }

    /// Atomically write back an edited TOML document.
    pub fn write_toml_document(&self, path: &Path, doc: &DocumentMut) -> Result<()> {
        self.write_atomic(path, doc.to_string().as_bytes())
    }

    /// Read a .env file into sorted key/value pairs. Missing file is empty.
    pub fn read_env(&self, path: &Path) -> Result<Vec<(String, String)>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(parse_env(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).context(format!("read {}", path.display())),
        }
    }

    /// Atomically write a .env file (entries sorted alphabetically).
    pub fn write_env(&self, path: &Path, entries: &[(String, String)]) -> Result<()> {
        self.write_atomic(path, render_env(entries).as_bytes())
    }

    /// Atomic write: parent dirs, `<path>.tmp`, fsync, rename, 0600.
    pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(format!("mkdir {}", parent.display()))?;
        }

        let tmp = path.with_extension(match path.extension() {
            Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
            None => "tmp".to_string(),
        });

        {
            let mut file =
                fs::File::create(&tmp).context(format!("create {}", tmp.display()))?;
            file.write_all(contents)
                .context(format!("write {}", tmp.display()))?;
            file.sync_all().context("fsync")?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .context("chmod 0600")?;
        }

        fs::rename(&tmp, path).context(format!("rename into {}", path.display()))?;

        // The rename changed the mtime; drop any stale cache entry
        let mut guard = self.cache.lock().unwrap();
        guard.0.remove(path);
        Ok(())
    }

    fn refresh_cache(&self, path: &Path, value: Value) {
        let Ok(meta) = fs::metadata(path) else {
            return;
        };
        let Ok(mtime) = meta.modified() else {
            return;
        };
        let mut guard = self.cache.lock().unwrap();
        let (cache, counter) = &mut *guard;
        *counter += 1;
        cache.insert(
            path.to_path_buf(),
            CacheEntry {
                mtime,
                value,
                last_used: *counter,
            },
        );
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}
