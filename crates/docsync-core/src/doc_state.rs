use chrono::{DateTime, Utc};

/// Materialized content of one document.
///
/// Not internally synchronized. Mutators must only be called by the holder
/// of the document's lock.
#[derive(Debug, Clone)]
pub struct DocState {
    content: Vec<u8>,
    version: u64,
    last_modified: DateTime<Utc>,
    dirty: bool,
}

impl Default for DocState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocState {
    /// An empty, clean document at version 0.
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
            version: 0,
            last_modified: Utc::now(),
            dirty: false,
        }
    }

    /// Restore a document loaded from persistence. The result is clean.
    pub fn from_stored(content: Vec<u8>, version: u64) -> Self {
        Self {
            content,
            version,
            last_modified: Utc::now(),
            dirty: false,
        }
    }

    /// Replace the content. The version is bumped by exactly one even when the
    /// bytes are unchanged.
    pub fn update(&mut self, content: Vec<u8>) {
        self.content = content;
        self.version += 1;
        self.dirty = true;
        self.last_modified = Utc::now();
    }

    /// Called by the persistence collaborator after a successful write.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty_and_clean() {
        let state = DocState::new();
        assert!(state.is_empty());
        assert_eq!(state.size(), 0);
        assert_eq!(state.version(), 0);
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_update_bumps_version_and_dirties() {
        let mut state = DocState::new();
        let before = state.last_modified();

        state.update(b"hello".to_vec());

        assert_eq!(state.version(), 1);
        assert!(state.is_dirty());
        assert_eq!(state.content(), b"hello");
        assert_eq!(state.size(), 5);
        assert!(state.last_modified() >= before);
    }

    #[test]
    fn test_identical_content_still_bumps_version() {
        let mut state = DocState::from_stored(b"same".to_vec(), 7);

        state.update(b"same".to_vec());
        state.update(b"same".to_vec());

        assert_eq!(state.version(), 9);
    }

    #[test]
    fn test_mark_clean_only_clears_dirty() {
        let mut state = DocState::new();
        state.update(b"abc".to_vec());

        state.mark_clean();

        assert!(!state.is_dirty());
        assert_eq!(state.version(), 1);
        assert_eq!(state.content(), b"abc");
    }
}
