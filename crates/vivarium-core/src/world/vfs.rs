//! Per-world in-memory virtual filesystem.
//!
//! Agents inside a world whose VFS claims a path never touch the host
//! filesystem: reads hit the in-memory tree and a miss is simply *not
//! found*. Paths are normalized before every lookup.
//!
//! Write rules, in order: a read-only file refuses writes; a path
//! matching a readonly pattern refuses writes; creating a new file
//! requires a writable-pattern match when any writable patterns are
//! configured (no patterns means everything is writable).

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::glob::{matches_any, normalize_path, Glob};

/// File access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    #[serde(rename = "r")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// One virtual file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFile {
    pub content: String,
    pub mode: FileMode,
    pub created_at_ms: i64,
    pub modified_at_ms: i64,
}

impl VirtualFile {
    fn new(content: String, mode: FileMode) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            content,
            mode,
            created_at_ms: now,
            modified_at_ms: now,
        }
    }
}

/// Usage counters reported in world state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VfsMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Serialized form used by world snapshots.
#[derive(Debug, Serialize, Deserialize)]
struct VfsSnapshot {
    files: HashMap<String, VirtualFile>,
    readonly_patterns: Vec<String>,
    writable_patterns: Vec<String>,
    intercept_patterns: Vec<String>,
}

/// The virtual filesystem of one world.
#[derive(Debug, Default)]
pub struct VirtualFs {
    files: HashMap<String, VirtualFile>,
    readonly_patterns: Vec<String>,
    writable_patterns: Vec<String>,
    intercept_patterns: Vec<String>,
    readonly_globs: Vec<Glob>,
    writable_globs: Vec<Glob>,
    intercept_globs: Vec<Glob>,
    metrics: VfsMetrics,
}

impl VirtualFs {
    /// Apply a world configuration fragment:
    ///
    /// ```json
    /// {
    ///   "initial_files": {"/etc/app.conf": {"content": "...", "mode": "r"}},
    ///   "readonly_patterns": ["/etc/**"],
    ///   "writable_patterns": ["/data/**", "/tmp/**"],
    ///   "intercept_patterns": ["/**"]
    /// }
    /// ```
    ///
    /// Initial file values may also be bare strings (content, mode
    /// `rw`). When no intercept patterns are given but anything else
    /// is configured, the VFS claims every path (`/**`).
    pub fn configure(&mut self, config: &Value) {
        if let Some(files) = config.get("initial_files").and_then(Value::as_object) {
            for (path, spec) in files {
                let (content, mode) = match spec {
                    Value::String(s) => (s.clone(), FileMode::ReadWrite),
                    Value::Object(o) => {
                        let content = o
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let mode = match o.get("mode").and_then(Value::as_str) {
                            Some("r") => FileMode::ReadOnly,
                            _ => FileMode::ReadWrite,
                        };
                        (content, mode)
                    }
                    _ => continue,
                };
                self.files
                    .insert(normalize_path(path), VirtualFile::new(content, mode));
            }
        }

        self.readonly_patterns = string_list(config.get("readonly_patterns"));
        self.writable_patterns = string_list(config.get("writable_patterns"));
        self.intercept_patterns = string_list(config.get("intercept_patterns"));

        if self.intercept_patterns.is_empty()
            && (!self.files.is_empty()
                || !self.readonly_patterns.is_empty()
                || !self.writable_patterns.is_empty())
        {
            self.intercept_patterns.push("/**".to_string());
        }

        self.recompile();
    }

    /// Whether any files or patterns are configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.files.is_empty()
            || !self.readonly_patterns.is_empty()
            || !self.writable_patterns.is_empty()
            || !self.intercept_patterns.is_empty()
    }

    /// Does the VFS claim this path instead of the host filesystem?
    #[must_use]
    pub fn should_intercept(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.files.contains_key(&path) || matches_any(&path, &self.intercept_globs)
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    /// Read a file. A miss never falls through to the host.
    pub fn read(&mut self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        let file = self.files.get(&path)?;
        self.metrics.read_count += 1;
        self.metrics.bytes_read += file.content.len() as u64;
        Some(file.content.clone())
    }

    /// Create or update a file. Returns `false` when denied.
    pub fn write(&mut self, path: &str, content: &str, append: bool) -> bool {
        let path = normalize_path(path);

        if matches_any(&path, &self.readonly_globs) {
            return false;
        }

        match self.files.get_mut(&path) {
            Some(file) => {
                if file.mode == FileMode::ReadOnly {
                    return false;
                }
                if append {
                    file.content.push_str(content);
                } else {
                    file.content = content.to_string();
                }
                file.modified_at_ms = Utc::now().timestamp_millis();
            }
            None => {
                if !self.writable_globs.is_empty() && !matches_any(&path, &self.writable_globs) {
                    return false;
                }
                self.files
                    .insert(path, VirtualFile::new(content.to_string(), FileMode::ReadWrite));
            }
        }

        self.metrics.write_count += 1;
        self.metrics.bytes_written += content.len() as u64;
        true
    }

    /// Delete a file; read-only files refuse.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize_path(path);
        match self.files.get(&path) {
            Some(file) if file.mode == FileMode::ReadOnly => false,
            Some(_) => {
                self.files.remove(&path);
                true
            }
            None => false,
        }
    }

    /// Paths matching a glob, sorted.
    #[must_use]
    pub fn list(&self, pattern: &str) -> Vec<String> {
        let glob = Glob::path(pattern);
        let mut paths: Vec<String> = self
            .files
            .keys()
            .filter(|p| pattern == "*" || pattern == "/**" || glob.is_match(p))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Size, mode, and timestamps of one file.
    #[must_use]
    pub fn stat(&self, path: &str) -> Option<Value> {
        let path = normalize_path(path);
        let file = self.files.get(&path)?;
        Some(serde_json::json!({
            "path": path,
            "size": file.content.len(),
            "mode": if file.mode == FileMode::ReadOnly { "r" } else { "rw" },
            "created_at": file.created_at_ms,
            "modified_at": file.modified_at_ms,
        }))
    }

    #[must_use]
    pub fn metrics(&self) -> VfsMetrics {
        self.metrics
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Snapshot for world serialization.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(VfsSnapshot {
            files: self.files.clone(),
            readonly_patterns: self.readonly_patterns.clone(),
            writable_patterns: self.writable_patterns.clone(),
            intercept_patterns: self.intercept_patterns.clone(),
        })
        .unwrap_or_default()
    }

    /// Restore from a snapshot produced by [`Self::to_json`].
    pub fn from_json(&mut self, value: &Value) {
        let Ok(snapshot) = serde_json::from_value::<VfsSnapshot>(value.clone()) else {
            return;
        };
        self.files = snapshot.files;
        self.readonly_patterns = snapshot.readonly_patterns;
        self.writable_patterns = snapshot.writable_patterns;
        self.intercept_patterns = snapshot.intercept_patterns;
        self.metrics = VfsMetrics::default();
        self.recompile();
    }

    fn recompile(&mut self) {
        self.readonly_globs = self.readonly_patterns.iter().map(|p| Glob::path(p)).collect();
        self.writable_globs = self.writable_patterns.iter().map(|p| Glob::path(p)).collect();
        self.intercept_globs = self
            .intercept_patterns
            .iter()
            .map(|p| Glob::path(p))
            .collect();
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn configured() -> VirtualFs {
        let mut vfs = VirtualFs::default();
        vfs.configure(&json!({
            "initial_files": {
                "/data/x": "hello",
                "/etc/app.conf": {"content": "locked", "mode": "r"}
            },
            "writable_patterns": ["/data/**", "/tmp/**"]
        }));
        vfs
    }

    #[test]
    fn reads_hit_the_tree_and_misses_stay_virtual() {
        let mut vfs = configured();
        assert_eq!(vfs.read("/data/x").as_deref(), Some("hello"));
        assert_eq!(vfs.read("/data/missing"), None);
        assert_eq!(vfs.metrics().read_count, 1);
    }

    #[test]
    fn default_intercept_covers_everything() {
        let vfs = configured();
        assert!(vfs.should_intercept("/data/x"));
        assert!(vfs.should_intercept("/anywhere/else"));
    }

    #[test]
    fn explicit_intercept_patterns_are_narrow() {
        let mut vfs = VirtualFs::default();
        vfs.configure(&json!({
            "initial_files": {"/app/main.py": "pass"},
            "intercept_patterns": ["/app/**"]
        }));
        assert!(vfs.should_intercept("/app/lib.py"));
        assert!(!vfs.should_intercept("/home/user/file"));
        // A file present in the tree is always intercepted.
        assert!(vfs.should_intercept("/app/main.py"));
    }

    #[test]
    fn write_updates_and_creates() {
        let mut vfs = configured();
        assert!(vfs.write("/data/x", "bye", false));
        assert_eq!(vfs.read("/data/x").as_deref(), Some("bye"));

        assert!(vfs.write("/data/new.txt", "created", false));
        assert!(vfs.exists("/data/new.txt"));
    }

    #[test]
    fn append_mode() {
        let mut vfs = configured();
        assert!(vfs.write("/data/x", "!", true));
        assert_eq!(vfs.read("/data/x").as_deref(), Some("hello!"));
    }

    #[test]
    fn readonly_file_refuses_writes_and_delete() {
        let mut vfs = configured();
        assert!(!vfs.write("/etc/app.conf", "x", false));
        assert!(!vfs.remove("/etc/app.conf"));
        assert_eq!(vfs.read("/etc/app.conf").as_deref(), Some("locked"));
    }

    #[test]
    fn new_files_need_a_writable_pattern_match() {
        let mut vfs = configured();
        assert!(!vfs.write("/home/user/file", "x", false));
        assert!(vfs.write("/tmp/scratch", "x", false));
    }

    #[test]
    fn no_patterns_means_everything_writable() {
        let mut vfs = VirtualFs::default();
        vfs.configure(&json!({"initial_files": {"/a": "1"}}));
        assert!(vfs.write("/anywhere", "x", false));
    }

    #[test]
    fn readonly_patterns_deny_writes() {
        let mut vfs = VirtualFs::default();
        vfs.configure(&json!({
            "initial_files": {"/cfg/a": "1"},
            "readonly_patterns": ["/cfg/**"]
        }));
        assert!(!vfs.write("/cfg/a", "x", false));
        assert!(!vfs.write("/cfg/new", "x", false));
    }

    #[test]
    fn paths_are_normalized() {
        let mut vfs = configured();
        assert_eq!(vfs.read("/data/../data/./x").as_deref(), Some("hello"));
    }

    #[test]
    fn list_and_stat() {
        let vfs = configured();
        assert_eq!(vfs.list("/data/*"), vec!["/data/x".to_string()]);
        assert_eq!(vfs.list("*").len(), 2);

        let stat = vfs.stat("/etc/app.conf").unwrap();
        assert_eq!(stat["mode"], "r");
        assert_eq!(stat["size"], 6);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut vfs = configured();
        vfs.write("/data/extra", "more", false);
        let snapshot = vfs.to_json();

        let mut restored = VirtualFs::default();
        restored.from_json(&snapshot);
        assert_eq!(restored.read("/data/extra").as_deref(), Some("more"));
        assert_eq!(restored.file_count(), 3);
        // Patterns survive the round trip.
        assert!(!restored.write("/home/u/x", "x", false));
    }
}
