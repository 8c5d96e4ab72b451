use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque revision identifier. Ordering is plain byte order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId(Vec<u8>);

impl RevisionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Short form for labels and log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        if full.len() > 12 {
            full[..12].to_string()
        } else {
            full
        }
    }

    fn is_printable(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| b.is_ascii_graphic())
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_printable() {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({})", self)
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for RevisionId {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for RevisionId {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// A revision as reported by a provider. The first parent is the mainline
/// ("left") parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub parents: Vec<RevisionId>,
    /// Committer timestamp in seconds since the epoch.
    pub timestamp: i64,
    pub author: String,
    pub committer: Option<String>,
    pub message: String,
    pub tags: BTreeSet<String>,
    pub branch_nick: Option<String>,
}

impl Revision {
    pub fn new(id: impl Into<RevisionId>, parents: Vec<RevisionId>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            parents,
            timestamp,
            author: String::new(),
            committer: None,
            message: String::new(),
            tags: BTreeSet::new(),
            branch_nick: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_branch_nick(mut self, nick: impl Into<String>) -> Self {
        self.branch_nick = Some(nick.into());
        self
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefers_text_for_printable_ids() {
        assert_eq!(RevisionId::from("rev-a").to_string(), "rev-a");
        assert_eq!(RevisionId::new(vec![0x00, 0xab]).to_string(), "00ab");
        assert_eq!(RevisionId::new(Vec::new()).to_string(), "");
    }

    #[test]
    fn test_ordering_is_byte_order() {
        let a = RevisionId::from("a");
        let b = RevisionId::from("b");
        let aa = RevisionId::from("aa");
        assert!(a < b);
        assert!(a < aa);
        assert!(aa < b);
    }

    #[test]
    fn test_revision_helpers() {
        let rev = Revision::new("m", vec!["a".into(), "b".into()], 1_700_000_000)
            .with_message("Merge feature\n\nlong text")
            .with_tag("v1.0");

        assert!(rev.is_merge());
        assert_eq!(rev.summary(), "Merge feature");
        assert!(rev.tags.contains("v1.0"));
        assert_eq!(rev.committed_at().map(|d| d.timestamp()), Some(1_700_000_000));
    }
}
