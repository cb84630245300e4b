//! Pid table keyed by namespaced task name.

use std::collections::HashMap;

/// Registry key for a task: `"{domain}/{task_name}"`.
pub fn namespaced_key(domain: &str, task_name: &str) -> String {
    format!("{domain}/{task_name}")
}

/// Maps `"{domain}/{task_name}"` to the OS pid the task reported.
///
/// Owned by the server event loop; only `SetPid` writes to it. Entries are
/// never pruned, so a finished or killed task keeps its last pid until it
/// is overwritten by the next run.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    pids: HashMap<String, u32>,
}

impl ProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` for `domain/task_name`, replacing any previous value.
    pub fn set(&mut self, domain: &str, task_name: &str, pid: u32) {
        let key = namespaced_key(domain, task_name);
        if let Some(previous) = self.pids.insert(key.clone(), pid) {
            log::debug!("[Registry] {key}: pid {previous} -> {pid}");
        } else {
            log::debug!("[Registry] {key}: pid {pid}");
        }
    }

    /// Pid recorded for `domain/task_name`.
    pub fn get(&self, domain: &str, task_name: &str) -> Option<u32> {
        self.pids.get(&namespaced_key(domain, task_name)).copied()
    }

    /// Snapshot of all entries.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.pids.clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// Returns `true` if nothing was registered yet.
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut registry = ProcessRegistry::new();
        registry.set("example.com", "publish", 99999);
        assert_eq!(registry.get("example.com", "publish"), Some(99999));
        assert_eq!(registry.snapshot().get("example.com/publish"), Some(&99999));
    }

    #[test]
    fn test_domains_are_isolated() {
        let mut registry = ProcessRegistry::new();
        registry.set("a.com", "publish", 1);
        registry.set("b.com", "publish", 2);
        assert_eq!(registry.get("a.com", "publish"), Some(1));
        assert_eq!(registry.get("b.com", "publish"), Some(2));
        assert_eq!(registry.get("c.com", "publish"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let mut registry = ProcessRegistry::new();
        registry.set("d", "t", 1);
        registry.set("d", "t", 2);
        assert_eq!(registry.get("d", "t"), Some(2));
        assert_eq!(registry.len(), 1);
    }
}
