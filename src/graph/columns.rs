use crate::graph::builder::GraphMap;
use crate::graph::lines::{BranchLine, BranchLineTable, LineEnd, LineId, RowVisibility};
use serde::Serialize;
use tracing::debug;

/// Default number of free columns examined for a crossing-free slot.
pub const DEFAULT_SEARCH_HORIZON: usize = 4;

/// A transition accepted although it passes an occupied column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Crossing {
    pub row: usize,
    pub line: LineId,
    pub column: usize,
}

/// Closed row intervals reserved per column, in sequence coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupancy {
    columns: Vec<Vec<(usize, usize)>>,
}

impl Occupancy {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn is_free(&self, column: usize, lo: usize, hi: usize) -> bool {
        self.columns
            .get(column)
            .map_or(true, |spans| spans.iter().all(|&(a, b)| hi < a || b < lo))
    }

    pub fn reserve(&mut self, column: usize, lo: usize, hi: usize) {
        if self.columns.len() <= column {
            self.columns.resize_with(column + 1, Vec::new);
        }
        self.columns[column].push((lo.min(hi), lo.max(hi)));
    }

    /// Finds a free lane for an edge between columns `a` and `b` over rows
    /// `lo..=hi`: first between the endpoints (from the right), then to the
    /// right of both. Column 0 is never handed out.
    pub fn allocate_lane(&mut self, a: usize, b: usize, lo: usize, hi: usize) -> usize {
        let (left, right) = (a.min(b), a.max(b));
        let between = (left.max(1)..=right).rev();
        let lane = between
            .chain(right + 1..)
            .find(|&column| column > 0 && self.is_free(column, lo, hi))
            .unwrap_or(self.width().max(1));
        self.reserve(lane, lo, hi);
        lane
    }
}

/// Column assignment for one collapse state. Independent of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnPlan {
    pub line_columns: Vec<Option<usize>>,
    /// Reserved `(start, end)` rows per line.
    pub spans: Vec<Option<(usize, usize)>>,
    pub crossings: Vec<Crossing>,
    pub occupancy: Occupancy,
}

impl ColumnPlan {
    pub fn column(&self, line: LineId) -> Option<usize> {
        self.line_columns.get(line.0).copied().flatten()
    }

    pub fn span(&self, line: LineId) -> Option<(usize, usize)> {
        self.spans.get(line.0).copied().flatten()
    }

    pub fn width(&self) -> usize {
        self.line_columns
            .iter()
            .flatten()
            .map(|c| c + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Sticky per-line column assignment.
#[derive(Debug, Clone)]
pub struct ColumnAllocator {
    horizon: usize,
}

impl Default for ColumnAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_HORIZON)
    }
}

impl ColumnAllocator {
    pub fn new(horizon: usize) -> Self {
        Self {
            horizon: horizon.max(1),
        }
    }

    pub fn assign(&self, map: &GraphMap, table: &BranchLineTable, rows: &RowVisibility) -> ColumnPlan {
        self.assign_seeded(map, table, rows, None)
    }

    /// Like [`assign`](Self::assign), but a line keeps its column from `seed`
    /// whenever that column is still free over the line's span. Lines without
    /// a usable seed column go through the normal search.
    pub fn assign_seeded(
        &self,
        map: &GraphMap,
        table: &BranchLineTable,
        rows: &RowVisibility,
        seed: Option<&ColumnPlan>,
    ) -> ColumnPlan {
        let mut plan = ColumnPlan {
            line_columns: vec![None; table.len()],
            spans: vec![None; table.len()],
            ..ColumnPlan::default()
        };

        for line in table.lines() {
            plan.spans[line.id.0] = Self::span(map, line, rows);
        }

        let mainline = table.mainline();
        if let Some(main) = mainline {
            if plan.spans[main.0].is_some() {
                plan.line_columns[main.0] = Some(0);
                plan.occupancy.reserve(0, 0, usize::MAX);
            }
        }

        let mut order: Vec<(usize, LineId)> = table
            .lines()
            .iter()
            .filter(|line| Some(line.id) != mainline)
            .filter_map(|line| plan.spans[line.id.0].map(|(start, _)| (start, line.id)))
            .collect();
        order.sort();

        // (row, from column, to column) of every placed transition
        let mut transitions: Vec<(usize, usize, usize)> = Vec::new();

        for (_, id) in order {
            let Some((start, end)) = plan.spans[id.0] else {
                continue;
            };
            let Some(line) = table.line(id) else {
                continue;
            };
            let shown = rows.is_line_shown(id);

            let merge_from = line
                .merged_by
                .filter(|m| shown && rows.is_kept(*m))
                .and_then(|m| table.line_of(m).and_then(|l| plan.line_columns[l.0]).map(|c| (m, c)));
            let fork_to = match line.end {
                LineEnd::Fork(f) if shown && rows.is_kept(f) => {
                    table.line_of(f).and_then(|l| plan.line_columns[l.0]).map(|c| (f, c))
                }
                _ => None,
            };

            let crossed = |column: usize| {
                let mut crossed = Vec::new();
                for (row, from) in merge_from.iter().chain(fork_to.iter()) {
                    crossed.extend(Self::crossed_columns(&plan.occupancy, &transitions, *row, *from, column));
                }
                crossed
            };

            let seeded = seed
                .and_then(|seed| seed.column(id))
                .filter(|&column| column > 0 && plan.occupancy.is_free(column, start, end));
            let (column, accepted) = match seeded {
                Some(column) => (column, crossed(column)),
                None => {
                    let mut candidates = Vec::with_capacity(self.horizon);
                    let mut column = 1;
                    while candidates.len() < self.horizon {
                        if plan.occupancy.is_free(column, start, end) {
                            candidates.push(column);
                        }
                        column += 1;
                    }
                    let chosen = candidates
                        .iter()
                        .copied()
                        .map(|c| (c, crossed(c)))
                        .find(|(_, crossed)| crossed.is_empty());
                    match chosen {
                        Some(found) => found,
                        None => (candidates[0], crossed(candidates[0])),
                    }
                }
            };
            if !accepted.is_empty() {
                debug!("Line {} accepts a crossing in column {}", id, column);
            }
            for (row, crossed_column) in accepted {
                plan.crossings.push(Crossing {
                    row,
                    line: id,
                    column: crossed_column,
                });
            }

            plan.occupancy.reserve(column, start, end);
            plan.line_columns[id.0] = Some(column);
            if let Some((row, from)) = merge_from {
                transitions.push((row, from, column));
            }
            if let Some((row, to)) = fork_to {
                transitions.push((row, column, to));
            }
        }

        debug!(
            "Assigned columns to {} lines ({} crossings)",
            plan.line_columns.iter().flatten().count(),
            plan.crossings.len()
        );
        plan
    }

    /// Rows a line reserves: from its merging row (or first kept row) to its
    /// fork row, one row of cooldown after a root, or the frame end when the
    /// chain leaves the loaded set.
    fn span(
        map: &GraphMap,
        line: &BranchLine,
        rows: &RowVisibility,
    ) -> Option<(usize, usize)> {
        let mut kept = line.members.iter().copied().filter(|&seq| rows.is_kept(seq));
        let first = kept.next()?;
        let last = kept.last().unwrap_or(first);
        if !rows.is_line_shown(line.id) {
            return Some((first, last));
        }
        let start = line.merged_by.filter(|&m| rows.is_kept(m)).unwrap_or(first).min(first);
        let end = match line.end {
            LineEnd::Fork(fork) if rows.is_kept(fork) => fork,
            LineEnd::Dangling => map.len(),
            _ => last + 1,
        };
        Some((start, end.max(last)))
    }

    /// Columns strictly between `from` and `to` that are busy at `row`, plus
    /// existing transitions on that row whose range interleaves.
    fn crossed_columns(
        occupancy: &Occupancy,
        transitions: &[(usize, usize, usize)],
        row: usize,
        from: usize,
        to: usize,
    ) -> Vec<(usize, usize)> {
        let (lo, hi) = (from.min(to), from.max(to));
        let mut crossed: Vec<(usize, usize)> = (lo + 1..hi)
            .filter(|&c| !occupancy.is_free(c, row, row))
            .map(|c| (row, c))
            .collect();
        for &(t_row, a, b) in transitions {
            if t_row != row {
                continue;
            }
            let (t_lo, t_hi) = (a.min(b), a.max(b));
            let interleaves = (t_lo < lo && lo < t_hi && t_hi < hi) || (lo < t_lo && t_lo < hi && hi < t_hi);
            if interleaves {
                crossed.push((row, t_lo.max(lo)));
            }
        }
        crossed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;
    use crate::models::{BranchTip, BranchTipSet};
    use crate::provider::MemoryProvider;
    use pretty_assertions::assert_eq;

    fn plan_for(provider: &MemoryProvider, tips: &BranchTipSet) -> (GraphMap, BranchLineTable, ColumnPlan) {
        let map = GraphBuilder::new(provider).build(tips).unwrap();
        let table = BranchLineTable::from_map(&map);
        let plan = ColumnAllocator::default().assign(&map, &table, &table.row_visibility(&map));
        (map, table, plan)
    }

    #[test]
    fn test_occupancy_intervals() {
        let mut occupancy = Occupancy::default();
        occupancy.reserve(1, 2, 5);
        assert!(!occupancy.is_free(1, 5, 9));
        assert!(occupancy.is_free(1, 6, 9));
        assert!(occupancy.is_free(3, 0, 100));
        assert_eq!(occupancy.width(), 2);
    }

    #[test]
    fn test_lane_search_prefers_between_then_right() {
        let mut occupancy = Occupancy::default();
        occupancy.reserve(0, 0, usize::MAX);
        occupancy.reserve(2, 0, 10);
        assert_eq!(occupancy.allocate_lane(3, 1, 0, 4), 3);
        assert_eq!(occupancy.allocate_lane(3, 1, 0, 4), 1);
        assert_eq!(occupancy.allocate_lane(0, 0, 0, 4), 4);
        assert_eq!(occupancy.allocate_lane(0, 0, 5, 9), 1);
    }

    #[test]
    fn test_side_line_takes_column_one() {
        let mut provider = MemoryProvider::new();
        provider
            .add("D", &[], 1)
            .add("B", &["D"], 2)
            .add("C", &["D"], 3)
            .add("A", &["B", "C"], 4);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "A")]);
        let (_, _, plan) = plan_for(&provider, &tips);

        assert_eq!(plan.line_columns, vec![Some(0), Some(1)]);
        assert_eq!(plan.span(LineId(1)), Some((0, 3)));
        assert!(plan.crossings.is_empty());
    }

    #[test]
    fn test_sequential_branches_reuse_a_column() {
        // M1 merges S (forks from M2), M2 merges T (forks from R)
        let mut provider = MemoryProvider::new();
        provider
            .add("R", &[], 1)
            .add("T", &["R"], 2)
            .add("M2", &["R", "T"], 3)
            .add("S", &["M2"], 4)
            .add("M1", &["M2", "S"], 5);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "M1")]);
        let (map, table, plan) = plan_for(&provider, &tips);

        let s = table.line_of(map.seq_of(&"S".into()).unwrap()).unwrap();
        let t = table.line_of(map.seq_of(&"T".into()).unwrap()).unwrap();
        assert_eq!(plan.column(s), Some(1));
        // S ends on M2's row, which is where T's span starts
        assert_eq!(plan.column(t), Some(2));
    }

    #[test]
    fn test_disjoint_branches_share_column() {
        let mut provider = MemoryProvider::new();
        provider
            .add("R", &[], 1)
            .add("Q", &["R"], 2)
            .add("T", &["Q"], 3)
            .add("M3", &["Q", "T"], 4)
            .add("M2", &["M3"], 5)
            .add("S", &["M2"], 6)
            .add("M1", &["M2", "S"], 7);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "M1")]);
        let (map, table, plan) = plan_for(&provider, &tips);

        let s = table.line_of(map.seq_of(&"S".into()).unwrap()).unwrap();
        let t = table.line_of(map.seq_of(&"T".into()).unwrap()).unwrap();
        assert_eq!(plan.column(s), Some(1));
        assert_eq!(plan.column(t), Some(1));
    }

    #[test]
    fn test_collapsed_line_has_no_column() {
        let mut provider = MemoryProvider::new();
        provider
            .add("D", &[], 1)
            .add("B", &["D"], 2)
            .add("C", &["D"], 3)
            .add("A", &["B", "C"], 4);
        let tips = BranchTipSet::from_tips([BranchTip::new("main", "A")]);
        let map = GraphBuilder::new(&provider).build(&tips).unwrap();
        let mut table = BranchLineTable::from_map(&map);
        table.collapse(LineId(1));
        let plan = ColumnAllocator::default().assign(&map, &table, &table.row_visibility(&map));
        assert_eq!(plan.line_columns, vec![Some(0), None]);
        assert_eq!(plan.width(), 1);
    }
}
