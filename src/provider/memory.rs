use crate::models::{Revision, RevisionId};
use crate::provider::{ProviderError, RevisionProvider};
use std::collections::{BTreeMap, HashMap};

/// In-memory revision store. Used by hosts that already hold the history
/// and by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    revisions: BTreeMap<RevisionId, Revision>,
    changed_paths: HashMap<RevisionId, Vec<String>>,
    heads: Vec<(RevisionId, String)>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, revision: Revision) -> &mut Self {
        self.revisions.insert(revision.id.clone(), revision);
        self
    }

    /// Shorthand for fixtures: `add("a", &["b", "c"], 10)`.
    pub fn add(&mut self, id: &str, parents: &[&str], timestamp: i64) -> &mut Self {
        let parents = parents.iter().map(|p| RevisionId::from(*p)).collect();
        self.insert(Revision::new(id, parents, timestamp).with_message(format!("commit {}", id)))
    }

    pub fn set_changed_paths(&mut self, id: &str, paths: &[&str]) -> &mut Self {
        self.changed_paths.insert(
            RevisionId::from(id),
            paths.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn add_head(&mut self, id: &str, label: &str) -> &mut Self {
        self.heads.push((RevisionId::from(id), label.to_string()));
        self
    }

    pub fn get_mut(&mut self, id: &RevisionId) -> Option<&mut Revision> {
        self.revisions.get_mut(id)
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.revisions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

impl RevisionProvider for MemoryProvider {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        self.revisions
            .get(id)
            .map(|rev| rev.parents.clone())
            .ok_or_else(|| ProviderError::UnknownRevision(id.clone()))
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        self.revisions
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownRevision(id.clone()))
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        Ok(self.heads.clone())
    }

    fn supports_changed_paths(&self) -> bool {
        true
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        if !self.revisions.contains_key(id) {
            return Err(ProviderError::UnknownRevision(id.clone()));
        }
        Ok(self.changed_paths.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_unknown_revision() {
        let mut provider = MemoryProvider::new();
        provider.add("b", &[], 1).add("a", &["b"], 2);

        assert_eq!(
            provider.parents(&"a".into()).unwrap(),
            vec![RevisionId::from("b")]
        );
        assert_eq!(provider.metadata(&"b".into()).unwrap().timestamp, 1);
        assert_eq!(
            provider.parents(&"zzz".into()),
            Err(ProviderError::UnknownRevision("zzz".into()))
        );
    }

    #[test]
    fn test_changed_paths_default_to_empty() {
        let mut provider = MemoryProvider::new();
        provider.add("a", &[], 1).add("b", &["a"], 2);
        provider.set_changed_paths("b", &["src/lib.rs"]);

        assert!(provider.changed_paths(&"a".into()).unwrap().is_empty());
        assert_eq!(
            provider.changed_paths(&"b".into()).unwrap(),
            vec!["src/lib.rs".to_string()]
        );
        assert!(provider.changed_paths(&"c".into()).is_err());
    }
}
