//! INI-backed key/value store for a single configuration plane.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ini::Ini;

use crate::{Error, Result};

/// One configuration plane, loaded into memory and written back atomically.
///
/// Missing files open as empty stores; read-only planes are simply never
/// synced. [`ConfigStore::sync`] serialises to a sibling temp file, fsyncs
/// and renames over the target, so a crash at any point leaves the prior
/// committed state on disk.
pub struct ConfigStore {
    path: PathBuf,
    doc: Ini,
}

impl ConfigStore {
    /// Open the plane at `path`, or start empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            Ini::load_from_file(&path).map_err(|e| Error::Config(e.to_string()))?
        } else {
            Ini::new()
        };
        Ok(Self { path, doc })
    }

    /// The on-disk location of this plane.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn section(group: &str) -> Option<String> {
        if group.is_empty() {
            None
        } else {
            Some(group.to_string())
        }
    }

    /// Look up `key` inside `group` (empty group = general area).
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.doc.get_from(Self::section(group), key)
    }

    /// Set `key` inside `group` to `value`.
    pub fn set(&mut self, group: &str, key: &str, value: impl Into<String>) {
        self.doc
            .set_to(Self::section(group), key.to_string(), value.into());
    }

    /// Remove `key` from `group`, if present.
    pub fn remove(&mut self, group: &str, key: &str) {
        self.doc.delete_from(Self::section(group), key);
    }

    /// Whether `group` contains `key`.
    pub fn contains(&self, group: &str, key: &str) -> bool {
        self.get(group, key).is_some()
    }

    /// All keys of `group`, lexicographically sorted.
    pub fn keys(&self, group: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .doc
            .section(Self::section(group))
            .map(|props| props.iter().map(|(k, _)| k.to_string()).collect())
            .unwrap_or_default();
        keys.sort();
        keys.dedup();
        keys
    }

    fn split_path(key: &str) -> (&str, &str) {
        match key.split_once('/') {
            Some((group, rest)) => (group, rest),
            None => ("", key),
        }
    }

    /// Look up a path key of the form `group/key` (or a bare general key).
    pub fn get_path(&self, key: &str) -> Option<&str> {
        let (group, key) = Self::split_path(key);
        self.get(group, key)
    }

    /// Set a path key of the form `group/key` (or a bare general key).
    pub fn set_path(&mut self, key: &str, value: impl Into<String>) {
        let (group, key) = Self::split_path(key);
        self.set(group, key, value);
    }

    /// Whether a path key is present.
    pub fn contains_path(&self, key: &str) -> bool {
        self.get_path(key).is_some()
    }

    /// Integer view of a value, `None` when absent or unparseable.
    pub fn get_i64(&self, group: &str, key: &str) -> Option<i64> {
        self.get(group, key).and_then(|v| v.trim().parse().ok())
    }

    /// Boolean view of a value: `true` and `1` are truthy, everything else
    /// is falsy. `None` when absent.
    pub fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        self.get(group, key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set(group, key, if value { "true" } else { "false" });
    }

    /// RFC 3339 date-time view of a value.
    pub fn get_datetime(&self, group: &str, key: &str) -> Option<DateTime<Utc>> {
        self.get(group, key)
            .and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_datetime(&mut self, group: &str, key: &str, value: DateTime<Utc>) {
        self.set(group, key, value.to_rfc3339());
    }

    /// Comma-separated string list view of a value.
    pub fn get_list(&self, group: &str, key: &str) -> Vec<String> {
        self.get(group, key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_list(&mut self, group: &str, key: &str, items: &[String]) {
        self.set(group, key, items.join(","));
    }

    /// Persist the plane to disk.
    ///
    /// Writes are atomic at the file level: serialise to `<path>.tmp`,
    /// fsync, rename over the target.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        self.doc
            .write_to(&mut buf)
            .map_err(|e| Error::Config(e.to_string()))?;

        let tmp = self.path.with_extension("ini.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
