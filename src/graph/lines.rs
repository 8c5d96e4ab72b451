use crate::graph::builder::{GraphMap, ParentLink};
use crate::graph::filter::{FilterMatches, Visibility};
use crate::models::RevisionId;
use crate::state::persist::CollapseStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Index of a line in its [`BranchLineTable`]. Stable for the lifetime of
/// one flattened [`GraphMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineId(pub usize);

impl LineId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identity of a line that survives rebuilds: the tip label for tip lines,
/// the head revision for lines opened at a merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LineKey {
    Tip(String),
    Merge(RevisionId),
}

impl LineKey {
    pub fn storage_key(&self) -> String {
        match self {
            LineKey::Tip(label) => format!("tip:{}", label),
            LineKey::Merge(id) => format!("rev:{}", id.to_hex()),
        }
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineKey::Tip(label) => write!(f, "{}", label),
            LineKey::Merge(id) => write!(f, "{}", id.short()),
        }
    }
}

/// How a line's first-parent chain ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineEnd {
    /// The tail has no parents.
    Root,
    /// The tail's first parent is the row at this sequence index.
    Fork(usize),
    /// The tail's first parent was not loaded.
    Dangling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLine {
    pub id: LineId,
    pub key: LineKey,
    pub labels: Vec<String>,
    pub tip_index: usize,
    /// Sequence indices, child to parent.
    pub members: Vec<usize>,
    pub merge_depth: u32,
    /// First row that merges this line's head as a non-first parent.
    pub merged_by: Option<usize>,
    pub end: LineEnd,
    pub collapsed: bool,
    /// Set by the layout compiler; `None` while the line has no kept rows.
    pub column: Option<usize>,
}

impl BranchLine {
    pub fn head(&self) -> Option<usize> {
        self.members.first().copied()
    }

    pub fn tail(&self) -> Option<usize> {
        self.members.last().copied()
    }

    pub fn is_tip_line(&self) -> bool {
        matches!(self.key, LineKey::Tip(_))
    }

    /// Lines merged into another line can be folded away.
    pub fn is_collapsible(&self) -> bool {
        self.merged_by.is_some()
    }
}

/// Collapse-level visibility of every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVisibility {
    pub shown_lines: Vec<bool>,
    /// Row survives collapsing (shown line or join).
    pub kept: Vec<bool>,
    /// Row of a hidden line kept because a shown line connects to it.
    pub join: Vec<bool>,
}

impl RowVisibility {
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.kept
            .iter()
            .enumerate()
            .filter_map(|(seq, kept)| kept.then_some(seq))
    }

    pub fn is_kept(&self, seq: usize) -> bool {
        self.kept.get(seq).copied().unwrap_or(false)
    }

    pub fn is_line_shown(&self, line: LineId) -> bool {
        self.shown_lines.get(line.0).copied().unwrap_or(false)
    }
}

/// Rows grouped into first-parent chains, plus collapse state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchLineTable {
    lines: Vec<BranchLine>,
    by_key: HashMap<LineKey, LineId>,
    /// Line of each row, by sequence index.
    row_lines: Vec<LineId>,
}

impl BranchLineTable {
    pub fn from_map(map: &GraphMap) -> Self {
        let mut lines: Vec<BranchLine> = map
            .origins()
            .iter()
            .enumerate()
            .map(|(index, origin)| BranchLine {
                id: LineId(index),
                key: origin.key.clone(),
                labels: origin.labels.clone(),
                tip_index: origin.tip_index,
                members: Vec::new(),
                merge_depth: origin.depth,
                merged_by: None,
                end: LineEnd::Root,
                collapsed: false,
                column: None,
            })
            .collect();

        let mut row_lines = Vec::with_capacity(map.len());
        for row in map.rows() {
            row_lines.push(row.line);
            if let Some(line) = lines.get_mut(row.line.0) {
                line.members.push(row.seq);
            }
        }

        for line in &mut lines {
            let (Some(head), Some(tail)) = (line.head(), line.tail()) else {
                continue;
            };
            line.merged_by = map.row(head).and_then(|row| {
                row.children.iter().copied().find(|&child| {
                    map.row(child).is_some_and(|c| {
                        c.parents
                            .iter()
                            .skip(1)
                            .any(|p| *p == ParentLink::Row(head))
                    })
                })
            });
            line.end = match map.row(tail).and_then(|row| row.parents.first()) {
                None => LineEnd::Root,
                Some(ParentLink::Row(fork)) => LineEnd::Fork(*fork),
                Some(ParentLink::Unloaded(_)) => LineEnd::Dangling,
            };
        }

        let by_key = lines.iter().map(|l| (l.key.clone(), l.id)).collect();
        Self {
            lines,
            by_key,
            row_lines,
        }
    }

    /// Builds the table for a rebuilt map. Lines known to `previous` keep
    /// their collapse flag; new lines follow the auto-collapse policy.
    pub fn rebuild(
        map: &GraphMap,
        previous: Option<&BranchLineTable>,
        auto_collapse_depth: Option<u32>,
    ) -> Self {
        let mut table = Self::from_map(map);
        for line in &mut table.lines {
            let carried = previous
                .and_then(|prev| prev.line_by_key(&line.key).and_then(|id| prev.line(id)))
                .map(|old| old.collapsed);
            line.collapsed = match carried {
                Some(collapsed) => collapsed,
                None => {
                    line.is_collapsible()
                        && auto_collapse_depth.is_some_and(|depth| line.merge_depth >= depth)
                }
            };
        }
        table.unfold_mainline();
        table
    }

    /// Applies flags saved by the host.
    pub fn restore(&mut self, store: &dyn CollapseStore) {
        let mut restored = 0;
        for line in &mut self.lines {
            if let Some(collapsed) = store.load(&line.key) {
                line.collapsed = collapsed;
                restored += 1;
            }
        }
        self.unfold_mainline();
        debug!("Restored {} collapse flags", restored);
    }

    fn unfold_mainline(&mut self) {
        if let Some(main) = self.mainline() {
            self.lines[main.0].collapsed = false;
        }
    }

    pub fn lines(&self) -> &[BranchLine] {
        &self.lines
    }

    pub fn line(&self, id: LineId) -> Option<&BranchLine> {
        self.lines.get(id.0)
    }

    pub fn line_by_key(&self, key: &LineKey) -> Option<LineId> {
        self.by_key.get(key).copied()
    }

    pub fn line_of(&self, seq: usize) -> Option<LineId> {
        self.row_lines.get(seq).copied()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The line of the first visible tip.
    pub fn mainline(&self) -> Option<LineId> {
        self.lines
            .first()
            .filter(|line| line.is_tip_line())
            .map(|line| line.id)
    }

    pub fn is_mainline(&self, id: LineId) -> bool {
        self.mainline() == Some(id)
    }

    pub fn is_collapsed(&self, id: LineId) -> bool {
        self.line(id).is_some_and(|line| line.collapsed)
    }

    /// Returns whether the flag changed. The mainline never collapses.
    pub fn set_collapsed(&mut self, id: LineId, collapsed: bool) -> bool {
        if collapsed && self.is_mainline(id) {
            return false;
        }
        match self.lines.get_mut(id.0) {
            Some(line) if line.collapsed != collapsed => {
                line.collapsed = collapsed;
                true
            }
            _ => false,
        }
    }

    pub fn collapse(&mut self, id: LineId) -> bool {
        self.set_collapsed(id, true)
    }

    pub fn expand(&mut self, id: LineId) -> bool {
        self.set_collapsed(id, false)
    }

    /// Flips the flag and returns the new state.
    pub fn toggle(&mut self, id: LineId) -> bool {
        let collapsed = !self.is_collapsed(id);
        self.set_collapsed(id, collapsed);
        self.is_collapsed(id)
    }

    pub fn expand_all(&mut self) -> Vec<LineId> {
        let mut changed = Vec::new();
        for line in &mut self.lines {
            if line.collapsed {
                line.collapsed = false;
                changed.push(line.id);
            }
        }
        changed
    }

    pub(crate) fn set_column(&mut self, id: LineId, column: Option<usize>) {
        if let Some(line) = self.lines.get_mut(id.0) {
            line.column = column;
        }
    }

    /// Expands whatever hides the row at `seq`: its own line and the chain
    /// of lines it was merged through. Returns the lines that changed.
    pub fn reveal(&mut self, seq: usize) -> Vec<LineId> {
        let mut changed = Vec::new();
        let mut cursor = self.line_of(seq);
        let mut guard = 0;
        while let Some(id) = cursor {
            if guard > self.lines.len() {
                break;
            }
            guard += 1;
            let Some(line) = self.lines.get(id.0) else {
                break;
            };
            if line.collapsed {
                changed.push(id);
            }
            cursor = if line.is_tip_line() {
                None
            } else {
                line.merged_by.and_then(|m| self.line_of(m))
            };
        }
        for id in &changed {
            self.expand(*id);
        }
        changed
    }

    /// Resolves which lines are shown: not collapsed, and either a tip line
    /// or merged from a shown line.
    pub fn shown_lines(&self) -> Vec<bool> {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Unknown,
            Visiting,
            Done(bool),
        }

        let mut state = vec![State::Unknown; self.lines.len()];
        for start in 0..self.lines.len() {
            let mut stack = vec![start];
            while let Some(&index) = stack.last() {
                if let State::Done(_) = state[index] {
                    stack.pop();
                    continue;
                }
                let line = &self.lines[index];
                let parent = if line.collapsed || line.is_tip_line() {
                    None
                } else {
                    line.merged_by.and_then(|m| self.line_of(m)).map(|l| l.0)
                };
                let resolved = match parent {
                    None => Some(!line.collapsed),
                    Some(p) => match state[p] {
                        State::Done(shown) => Some(shown),
                        // a merge cycle cannot come out of the builder
                        State::Visiting => Some(true),
                        State::Unknown => None,
                    },
                };
                match resolved {
                    Some(shown) => {
                        state[index] = State::Done(shown);
                        stack.pop();
                    }
                    None => {
                        state[index] = State::Visiting;
                        if let Some(p) = parent {
                            stack.push(p);
                        }
                    }
                }
            }
        }
        state
            .into_iter()
            .map(|s| matches!(s, State::Done(true)))
            .collect()
    }

    /// Rows that survive collapsing. Rows of hidden lines stay when a shown
    /// line forks from them or when they merge a shown row.
    pub fn row_visibility(&self, map: &GraphMap) -> RowVisibility {
        let shown_lines = self.shown_lines();
        let line_shown = |seq: usize| {
            self.line_of(seq)
                .and_then(|line| shown_lines.get(line.0).copied())
                .unwrap_or(false)
        };

        let mut kept: Vec<bool> = (0..map.len()).map(|seq| line_shown(seq)).collect();
        let mut join = vec![false; map.len()];
        for row in map.rows() {
            if kept[row.seq] {
                continue;
            }
            let forked_from = row.children.iter().any(|&child| {
                line_shown(child)
                    && map
                        .row(child)
                        .is_some_and(|c| c.parents.first() == Some(&ParentLink::Row(row.seq)))
            });
            let merges_shown = row.parents.iter().skip(1).any(|p| match p {
                ParentLink::Row(parent) => line_shown(*parent),
                ParentLink::Unloaded(_) => false,
            });
            if forked_from || merges_shown {
                join[row.seq] = true;
            }
        }
        for (seq, is_join) in join.iter().enumerate() {
            if *is_join {
                kept[seq] = true;
            }
        }

        RowVisibility {
            shown_lines,
            kept,
            join,
        }
    }

    /// Sequence indices of the rows a frame would show, optionally narrowed
    /// by filter matches.
    pub fn visible_rows(&self, map: &GraphMap, filter: Option<&FilterMatches>) -> Vec<usize> {
        let rows = self.row_visibility(map);
        Visibility::compute(map, &rows, filter).rows().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;
    use crate::models::{BranchTip, BranchTipSet};
    use crate::provider::MemoryProvider;
    use crate::state::persist::MemoryCollapseStore;
    use pretty_assertions::assert_eq;

    /// A merges B (first) and C; both fork from D.
    fn simple_merge() -> (MemoryProvider, BranchTipSet) {
        let mut provider = MemoryProvider::new();
        provider
            .add("D", &[], 1)
            .add("B", &["D"], 2)
            .add("C", &["D"], 3)
            .add("A", &["B", "C"], 4);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "A")]);
        (provider, tips)
    }

    fn build(provider: &MemoryProvider, tips: &BranchTipSet) -> GraphMap {
        GraphBuilder::new(provider).build(tips).unwrap()
    }

    #[test]
    fn test_lines_group_first_parent_chains() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);
        let table = BranchLineTable::from_map(&map);

        assert_eq!(table.len(), 2);
        let main = table.line(LineId(0)).unwrap();
        assert_eq!(main.key, LineKey::Tip("main".into()));
        assert_eq!(main.members, vec![0, 1, 3]);
        assert_eq!(main.end, LineEnd::Root);
        assert_eq!(main.merged_by, None);

        let side = table.line(LineId(1)).unwrap();
        assert_eq!(side.key, LineKey::Merge("C".into()));
        assert_eq!(side.members, vec![2]);
        assert_eq!(side.merged_by, Some(0));
        assert_eq!(side.end, LineEnd::Fork(3));
        assert_eq!(side.merge_depth, 1);
    }

    #[test]
    fn test_mainline_cannot_collapse() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);

        assert!(!table.collapse(LineId(0)));
        assert!(table.collapse(LineId(1)));
        assert!(!table.collapse(LineId(1)));
        assert!(!table.toggle(LineId(1)));
        assert_eq!(table.visible_rows(&map, None), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_collapse_hides_interior_rows() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);
        table.collapse(LineId(1));

        let rows = table.row_visibility(&map);
        assert_eq!(rows.shown_lines, vec![true, false]);
        assert_eq!(rows.rows().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(rows.join.iter().all(|j| !j));
    }

    #[test]
    fn test_collapse_cascades_and_keeps_fork_points() {
        // main: M1 -> M2 -> R; M1 merges S1 (line 1); S1 -> S2 -> R and
        // S1 merges T1 (line 2) which forks from S2.
        let mut provider = MemoryProvider::new();
        provider
            .add("R", &[], 1)
            .add("S2", &["R"], 2)
            .add("T1", &["S2"], 3)
            .add("S1", &["S2", "T1"], 4)
            .add("M2", &["R"], 5)
            .add("M1", &["M2", "S1"], 6);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "M1")]);
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);
        assert_eq!(table.len(), 3);

        let inner = table.line_by_key(&LineKey::Merge("T1".into())).unwrap();
        let outer = table.line_by_key(&LineKey::Merge("S1".into())).unwrap();

        table.collapse(outer);
        let rows = table.row_visibility(&map);
        assert!(!rows.is_line_shown(outer));
        assert!(!rows.is_line_shown(inner));
        assert!(!table.is_collapsed(inner));
        let visible: Vec<_> = rows.rows().map(|s| map.row(s).unwrap().id.to_string()).collect();
        assert_eq!(visible, vec!["M1", "M2", "R"]);

        // collapsing only the inner line leaves the outer one shown
        table.expand(outer);
        table.collapse(inner);
        let rows = table.row_visibility(&map);
        assert!(rows.is_line_shown(outer));
        assert!(!rows.is_line_shown(inner));
    }

    #[test]
    fn test_fork_point_of_shown_line_is_join() {
        // M1 merges the S line; M2 merges F, which forks from S2.
        let mut provider = MemoryProvider::new();
        provider
            .add("R", &[], 1)
            .add("S2", &["R"], 2)
            .add("S1", &["S2"], 3)
            .add("F", &["S2"], 4)
            .add("M2", &["R", "F"], 5)
            .add("M1", &["M2", "S1"], 6);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "M1")]);
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);

        let side = table.line_by_key(&LineKey::Merge("S1".into())).unwrap();
        let feature = table.line_by_key(&LineKey::Merge("F".into())).unwrap();
        table.collapse(side);

        let rows = table.row_visibility(&map);
        assert!(rows.is_line_shown(feature));
        let s1 = map.seq_of(&"S1".into()).unwrap();
        let s2 = map.seq_of(&"S2".into()).unwrap();
        assert!(!rows.is_kept(s1));
        assert!(rows.join[s2]);
        assert!(rows.is_kept(s2));
    }

    #[test]
    fn test_rebuild_carries_flags_and_policy() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);

        let fresh = BranchLineTable::rebuild(&map, None, Some(1));
        assert!(fresh.is_collapsed(LineId(1)));
        assert!(!fresh.is_collapsed(LineId(0)));

        let mut previous = BranchLineTable::from_map(&map);
        previous.collapse(LineId(1));
        let carried = BranchLineTable::rebuild(&map, Some(&previous), None);
        assert!(carried.is_collapsed(LineId(1)));
    }

    #[test]
    fn test_restore_and_reveal() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);

        let mut store = MemoryCollapseStore::new();
        store.store(&LineKey::Merge("C".into()), true);
        store.store(&LineKey::Tip("main".into()), true);
        table.restore(&store);
        assert!(table.is_collapsed(LineId(1)));
        assert!(!table.is_collapsed(LineId(0)));

        assert_eq!(table.reveal(2), vec![LineId(1)]);
        assert!(!table.is_collapsed(LineId(1)));
        assert!(table.reveal(2).is_empty());
    }

    #[test]
    fn test_expand_all() {
        let (provider, tips) = simple_merge();
        let map = build(&provider, &tips);
        let mut table = BranchLineTable::from_map(&map);
        table.collapse(LineId(1));
        assert_eq!(table.expand_all(), vec![LineId(1)]);
        assert!(table.expand_all().is_empty());
    }

    #[test]
    fn test_storage_keys() {
        assert_eq!(LineKey::Tip("main".into()).storage_key(), "tip:main");
        assert_eq!(LineKey::Merge(vec![0x01, 0xff].into()).storage_key(), "rev:01ff");
    }
}
