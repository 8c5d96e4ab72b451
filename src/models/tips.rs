use crate::models::RevisionId;
use serde::{Deserialize, Serialize};

/// A named head to be shown as the top of a branch line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTip {
    pub id: RevisionId,
    pub label: String,
    /// Preferred ordering among secondary tips, larger first (usually the
    /// head's timestamp).
    pub sort_key: i64,
    pub visible: bool,
}

impl BranchTip {
    pub fn new(label: impl Into<String>, id: impl Into<RevisionId>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            sort_key: 0,
            visible: true,
        }
    }

    pub fn with_sort_key(mut self, sort_key: i64) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// Ordered tip collection. Index 0 is the mainline. Labels are unique,
/// revision ids are not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTipSet {
    tips: Vec<BranchTip>,
}

/// A visible head after folding tips that share a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipHead {
    pub id: RevisionId,
    /// Index of the first tip carrying this revision.
    pub tip_index: usize,
    pub labels: Vec<String>,
}

impl BranchTipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tips(tips: impl IntoIterator<Item = BranchTip>) -> Self {
        let mut set = Self::new();
        for tip in tips {
            set.add(tip);
        }
        set
    }

    /// Appends a tip, or replaces the tip with the same label in place.
    pub fn add(&mut self, tip: BranchTip) {
        if let Some(existing) = self.tips.iter_mut().find(|t| t.label == tip.label) {
            *existing = tip;
        } else {
            self.tips.push(tip);
        }
    }

    pub fn remove(&mut self, label: &str) -> Option<BranchTip> {
        let index = self.position(label)?;
        Some(self.tips.remove(index))
    }

    /// Moves the tip with `label` to `new_index` (clamped to the end).
    pub fn reorder(&mut self, label: &str, new_index: usize) -> bool {
        let Some(index) = self.position(label) else {
            return false;
        };
        let tip = self.tips.remove(index);
        let new_index = new_index.min(self.tips.len());
        self.tips.insert(new_index, tip);
        true
    }

    pub fn set_visible(&mut self, label: &str, visible: bool) -> bool {
        match self.tips.iter_mut().find(|t| t.label == label) {
            Some(tip) => {
                tip.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Orders every tip after the mainline by descending sort key. Stable
    /// for equal keys.
    pub fn sort_secondary(&mut self) {
        if self.tips.len() > 2 {
            self.tips[1..].sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
        }
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.tips.iter().position(|t| t.label == label)
    }

    pub fn get(&self, label: &str) -> Option<&BranchTip> {
        self.tips.iter().find(|t| t.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BranchTip> {
        self.tips.iter()
    }

    pub fn len(&self) -> usize {
        self.tips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    /// Visible tips folded by revision id, in tip order.
    pub fn visible_heads(&self) -> Vec<TipHead> {
        let mut heads: Vec<TipHead> = Vec::new();
        for (index, tip) in self.tips.iter().enumerate() {
            if !tip.visible {
                continue;
            }
            match heads.iter_mut().find(|h| h.id == tip.id) {
                Some(head) => head.labels.push(tip.label.clone()),
                None => heads.push(TipHead {
                    id: tip.id.clone(),
                    tip_index: index,
                    labels: vec![tip.label.clone()],
                }),
            }
        }
        heads
    }
}
