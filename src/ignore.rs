//! Exclusion policy for objects the engine must never touch

use std::path::Path;

use tracing::trace;

/// Decides whether an object is worth synchronizing at all. Excluded names
/// are never uploaded, downloaded, or deleted by the reconciler.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    /// User-configured substring patterns, matched against the leafname.
    patterns: Vec<String>,
}

impl Default for IgnorePolicy {
    fn default() -> Self {
        Self { patterns: Vec::new() }
    }
}

impl IgnorePolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Built-in exclusions: hidden files and common editor temp files.
    fn is_junk(name: &str) -> bool {
        if name.starts_with('.') {
            return true;
        }
        if name.ends_with('~') || name.ends_with(".tmp") || name.ends_with(".swp") {
            return true;
        }
        if name.starts_with('#') && name.ends_with('#') {
            return true;
        }
        // Office lock files
        if name.starts_with("~$") {
            return true;
        }
        false
    }

    pub fn worth_syncing(&self, parent: &Path, name: &str) -> bool {
        if Self::is_junk(name) {
            trace!("Skipping junk name {} in {}", name, parent.display());
            return false;
        }
        if self.patterns.iter().any(|p| name.contains(p.as_str())) {
            trace!("Skipping excluded name {} in {}", name, parent.display());
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn excludes_hidden_and_temp_files() {
        let policy = IgnorePolicy::default();
        let parent = PathBuf::from("/data");
        assert!(!policy.worth_syncing(&parent, ".git"));
        assert!(!policy.worth_syncing(&parent, "notes.txt~"));
        assert!(!policy.worth_syncing(&parent, "buffer.swp"));
        assert!(!policy.worth_syncing(&parent, "#draft.md#"));
        assert!(!policy.worth_syncing(&parent, "~$report.docx"));
        assert!(policy.worth_syncing(&parent, "report.docx"));
    }

    #[test]
    fn excludes_configured_patterns() {
        let policy = IgnorePolicy::new(vec!["node_modules".to_string(), ".bak".to_string()]);
        let parent = PathBuf::from("/data");
        assert!(!policy.worth_syncing(&parent, "node_modules"));
        assert!(!policy.worth_syncing(&parent, "report.bak"));
        assert!(policy.worth_syncing(&parent, "report.pdf"));
    }
}
