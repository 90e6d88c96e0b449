//! Per-agent permissions and predicate evaluation.
//!
//! Every privileged syscall consults one of the predicates here before
//! doing work. Permissions are created lazily with the `standard`
//! preset the first time an agent id is seen.
//!
//! Path filters are prefix lists over normalized absolute paths.
//! Command filters match the leading program token (or its basename).
//! The domain whitelist uses label-wise globbing where `*` matches
//! exactly one DNS label.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::glob::normalize_path;

/// Named permission presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Unrestricted,
    Standard,
    Sandboxed,
    Readonly,
    Minimal,
}

impl FromStr for PermissionLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unrestricted" => Ok(Self::Unrestricted),
            "standard" => Ok(Self::Standard),
            "sandboxed" => Ok(Self::Sandboxed),
            "readonly" => Ok(Self::Readonly),
            "minimal" => Ok(Self::Minimal),
            _ => Err(()),
        }
    }
}

/// The full permission set for one agent.
///
/// A capability bit of `false` wins over every list; an empty allow
/// list means "no restriction beyond the bit".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPermissions {
    pub can_read: bool,
    pub can_write: bool,
    pub can_exec: bool,
    pub can_think: bool,
    pub can_spawn: bool,
    pub can_network: bool,

    pub allowed_read_paths: Vec<String>,
    pub allowed_write_paths: Vec<String>,
    pub blocked_paths: Vec<String>,

    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,

    pub allowed_domains: Vec<String>,

    /// 0 means unlimited.
    pub max_memory_bytes: u64,
    /// 0 means unlimited.
    pub max_cpu_percent: u32,
    /// 0 means unlimited.
    pub max_llm_calls_per_minute: u32,
}

impl Default for AgentPermissions {
    fn default() -> Self {
        Self::preset(PermissionLevel::Standard)
    }
}

impl AgentPermissions {
    /// Build one of the five presets.
    #[must_use]
    pub fn preset(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Unrestricted => Self {
                can_read: true,
                can_write: true,
                can_exec: true,
                can_think: true,
                can_spawn: true,
                can_network: true,
                allowed_read_paths: Vec::new(),
                allowed_write_paths: Vec::new(),
                blocked_paths: Vec::new(),
                allowed_commands: Vec::new(),
                blocked_commands: Vec::new(),
                allowed_domains: Vec::new(),
                max_memory_bytes: 0,
                max_cpu_percent: 0,
                max_llm_calls_per_minute: 0,
            },
            PermissionLevel::Standard => Self {
                can_read: true,
                can_write: true,
                can_exec: true,
                can_think: true,
                can_spawn: true,
                can_network: true,
                allowed_read_paths: Vec::new(),
                allowed_write_paths: Vec::new(),
                blocked_paths: vec![
                    "/etc/shadow".into(),
                    "/etc/sudoers".into(),
                    "/root/.ssh".into(),
                ],
                allowed_commands: Vec::new(),
                blocked_commands: vec![
                    "sudo".into(),
                    "su".into(),
                    "shutdown".into(),
                    "reboot".into(),
                    "mkfs".into(),
                ],
                allowed_domains: Vec::new(),
                max_memory_bytes: 0,
                max_cpu_percent: 0,
                max_llm_calls_per_minute: 60,
            },
            PermissionLevel::Sandboxed => Self {
                can_read: true,
                can_write: true,
                can_exec: false,
                can_think: true,
                can_spawn: false,
                can_network: false,
                allowed_read_paths: vec!["/tmp".into()],
                allowed_write_paths: vec!["/tmp".into()],
                blocked_paths: Vec::new(),
                allowed_commands: Vec::new(),
                blocked_commands: Vec::new(),
                allowed_domains: Vec::new(),
                max_memory_bytes: 256 * 1024 * 1024,
                max_cpu_percent: 25,
                max_llm_calls_per_minute: 30,
            },
            PermissionLevel::Readonly => Self {
                can_read: true,
                can_write: false,
                can_exec: false,
                can_think: true,
                can_spawn: false,
                can_network: false,
                allowed_read_paths: Vec::new(),
                allowed_write_paths: Vec::new(),
                blocked_paths: vec!["/etc/shadow".into(), "/root/.ssh".into()],
                allowed_commands: Vec::new(),
                blocked_commands: Vec::new(),
                allowed_domains: Vec::new(),
                max_memory_bytes: 0,
                max_cpu_percent: 0,
                max_llm_calls_per_minute: 30,
            },
            PermissionLevel::Minimal => Self {
                can_read: false,
                can_write: false,
                can_exec: false,
                can_think: true,
                can_spawn: false,
                can_network: false,
                allowed_read_paths: Vec::new(),
                allowed_write_paths: Vec::new(),
                blocked_paths: Vec::new(),
                allowed_commands: Vec::new(),
                blocked_commands: Vec::new(),
                allowed_domains: Vec::new(),
                max_memory_bytes: 64 * 1024 * 1024,
                max_cpu_percent: 10,
                max_llm_calls_per_minute: 10,
            },
        }
    }

    /// May the agent read `path`?
    ///
    /// The path is not in the blocked list and either the allow list is
    /// empty or some entry is a prefix of it.
    #[must_use]
    pub fn can_read_path(&self, path: &str) -> bool {
        if !self.can_read {
            return false;
        }
        let path = normalize_path(path);
        !prefix_matches(&path, &self.blocked_paths)
            && (self.allowed_read_paths.is_empty()
                || prefix_matches(&path, &self.allowed_read_paths))
    }

    /// May the agent write `path`? Mirrors [`Self::can_read_path`]
    /// against the write allow list.
    #[must_use]
    pub fn can_write_path(&self, path: &str) -> bool {
        if !self.can_write {
            return false;
        }
        let path = normalize_path(path);
        !prefix_matches(&path, &self.blocked_paths)
            && (self.allowed_write_paths.is_empty()
                || prefix_matches(&path, &self.allowed_write_paths))
    }

    /// May the agent execute `command`? Only the leading program token
    /// is consulted.
    #[must_use]
    pub fn can_exec_command(&self, command: &str) -> bool {
        if !self.can_exec {
            return false;
        }
        let Some(program) = command.split_whitespace().next() else {
            return false;
        };
        let basename = program.rsplit('/').next().unwrap_or(program);

        let hit = |list: &[String]| list.iter().any(|c| c == program || c == basename);

        !hit(&self.blocked_commands) && (self.allowed_commands.is_empty() || hit(&self.allowed_commands))
    }

    /// May the agent reach `url`? The host must match the domain
    /// whitelist; an empty whitelist allows every host.
    #[must_use]
    pub fn can_access_url(&self, url: &str) -> bool {
        if !self.can_network {
            return false;
        }
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = extract_host(url);
        self.allowed_domains
            .iter()
            .any(|pattern| domain_matches(&host, pattern))
    }
}

/// Host part of a URL: scheme and path stripped, port removed.
#[must_use]
pub fn extract_host(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = host.rsplit('@').next().unwrap_or(host);
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

fn prefix_matches(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| {
        let p = normalize_path(p);
        path == p || path.starts_with(&format!("{p}/")) || p == "/"
    })
}

/// Label-wise domain glob: `*` matches exactly one label.
fn domain_matches(host: &str, pattern: &str) -> bool {
    let host_labels: Vec<&str> = host.split('.').collect();
    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    if host_labels.len() != pattern_labels.len() {
        return false;
    }
    host_labels
        .iter()
        .zip(pattern_labels.iter())
        .all(|(h, p)| *p == "*" || h.eq_ignore_ascii_case(p))
}

/// Permission objects keyed by agent id.
///
/// Entries are created on first access with the `standard` preset and
/// purged when the agent id is reaped.
#[derive(Debug, Default)]
pub struct PermissionsStore {
    inner: Mutex<HashMap<u32, AgentPermissions>>,
}

impl PermissionsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the agent's permissions, creating the default entry
    /// if this id is new.
    #[must_use]
    pub fn get_or_create(&self, agent_id: u32) -> AgentPermissions {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        inner.entry(agent_id).or_default().clone()
    }

    /// Replace an agent's permissions wholesale.
    pub fn set(&self, agent_id: u32, perms: AgentPermissions) {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        inner.insert(agent_id, perms);
    }

    /// Apply a preset to an agent.
    pub fn set_level(&self, agent_id: u32, level: PermissionLevel) {
        self.set(agent_id, AgentPermissions::preset(level));
    }

    /// Drop the entry for a reaped agent id.
    pub fn purge(&self, agent_id: u32) {
        let mut inner = self.inner.lock().expect("permissions lock poisoned");
        inner.remove(&agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_prefix_wins() {
        let mut perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        perms.blocked_paths = vec!["/etc".into()];
        assert!(!perms.can_read_path("/etc/passwd"));
        assert!(!perms.can_read_path("/etc"));
        assert!(perms.can_read_path("/etcetera"));
        assert!(perms.can_read_path("/home/u/notes"));
    }

    #[test]
    fn empty_allow_list_means_open() {
        let perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        assert!(perms.can_read_path("/anything"));
        assert!(perms.can_write_path("/anything"));
    }

    #[test]
    fn allow_list_restricts() {
        let mut perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        perms.allowed_write_paths = vec!["/tmp".into(), "/var/scratch".into()];
        assert!(perms.can_write_path("/tmp/file"));
        assert!(perms.can_write_path("/var/scratch/a/b"));
        assert!(!perms.can_write_path("/var/log/x"));
        assert!(!perms.can_write_path("/tmpfile"));
    }

    #[test]
    fn normalization_applies_before_matching() {
        let mut perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        perms.blocked_paths = vec!["/etc".into()];
        assert!(!perms.can_read_path("/var/../etc/passwd"));
    }

    #[test]
    fn capability_bit_overrides_lists() {
        let perms = AgentPermissions::preset(PermissionLevel::Readonly);
        assert!(perms.can_read_path("/tmp/x"));
        assert!(!perms.can_write_path("/tmp/x"));
        assert!(!perms.can_exec_command("ls"));
    }

    #[test]
    fn exec_checks_leading_token_and_basename() {
        let perms = AgentPermissions::preset(PermissionLevel::Standard);
        assert!(perms.can_exec_command("ls -la /tmp"));
        assert!(!perms.can_exec_command("sudo rm -rf /"));
        assert!(!perms.can_exec_command("/usr/bin/sudo id"));
        assert!(!perms.can_exec_command(""));
    }

    #[test]
    fn exec_allow_list() {
        let mut perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        perms.allowed_commands = vec!["echo".into(), "cat".into()];
        assert!(perms.can_exec_command("echo hi"));
        assert!(perms.can_exec_command("/bin/echo hi"));
        assert!(!perms.can_exec_command("rm -rf /"));
    }

    #[test]
    fn domain_star_matches_one_label() {
        let mut perms = AgentPermissions::preset(PermissionLevel::Unrestricted);
        perms.allowed_domains = vec!["*.example.com".into()];
        assert!(perms.can_access_url("https://api.example.com/v1"));
        assert!(!perms.can_access_url("https://a.b.example.com/v1"));
        assert!(!perms.can_access_url("https://example.com/v1"));
    }

    #[test]
    fn empty_domain_whitelist_allows_all() {
        let perms = AgentPermissions::preset(PermissionLevel::Standard);
        assert!(perms.can_access_url("https://anywhere.net/x"));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("https://API.Example.com:8443/v1?q=1"), "api.example.com");
        assert_eq!(extract_host("example.org/path"), "example.org");
        assert_eq!(extract_host("http://user@host.net/"), "host.net");
    }

    #[test]
    fn store_creates_standard_on_first_access() {
        let store = PermissionsStore::new();
        let perms = store.get_or_create(9);
        assert!(perms.can_read);
        assert_eq!(perms.max_llm_calls_per_minute, 60);

        store.set_level(9, PermissionLevel::Minimal);
        assert!(!store.get_or_create(9).can_read);

        store.purge(9);
        // Recreated with the default preset after purge.
        assert!(store.get_or_create(9).can_read);
    }
}
