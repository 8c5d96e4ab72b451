use crate::graph::builder::{GraphMap, ParentLink};
use crate::graph::columns::{ColumnAllocator, ColumnPlan, Crossing};
use crate::graph::filter::{FilterMatches, Visibility};
use crate::graph::lines::{BranchLineTable, LineId, RowVisibility};
use crate::models::RevisionId;
use crate::state::error_handling::{EngineError, ErrorReporter};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};

/// How an edge reaches its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The true parent is on screen. When it is not the next visible row,
    /// `via_column` names the column the edge runs in.
    Direct,
    /// `hidden` revisions were passed on the way to a visible ancestor.
    Skipped { hidden: usize },
    /// The chain leaves the loaded revisions.
    Dangling { hidden: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// Sequence index of the child row.
    pub from_row: usize,
    /// Sequence index of the parent row; `None` for dangling edges.
    pub to_row: Option<usize>,
    /// Position in the child's parent list.
    pub parent_index: usize,
    pub kind: EdgeKind,
    pub from_column: usize,
    /// Column the edge runs in between its endpoints, if it needs one.
    pub via_column: Option<usize>,
    pub to_column: Option<usize>,
}

/// Collapse/expand handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Twisty {
    pub column: usize,
    /// Every target line is expanded.
    pub expanded: bool,
    pub targets: Vec<LineId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutRow {
    pub seq: usize,
    #[serde(serialize_with = "serialize_id")]
    pub id: RevisionId,
    pub column: usize,
    pub line: LineId,
    pub merge_depth: u32,
    /// Kept for connectivity without matching the filter.
    pub hollow: bool,
    /// Kept although its line is collapsed.
    pub join: bool,
    pub labels: Vec<String>,
    pub twisty: Option<Twisty>,
}

fn serialize_id<S: Serializer>(id: &RevisionId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

/// Immutable snapshot handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayoutFrame {
    pub generation: u64,
    pub rows: Vec<LayoutRow>,
    pub edges: Vec<Edge>,
    pub crossings: Vec<Crossing>,
    pub width: usize,
    pub more_available: bool,
    pub truncated: bool,
    pub errors: Vec<String>,
    /// An internal invariant failed; the frame may draw overlapping lines.
    pub degraded: bool,
}

impl LayoutFrame {
    pub fn row(&self, seq: usize) -> Option<&LayoutRow> {
        self.rows
            .binary_search_by_key(&seq, |row| row.seq)
            .ok()
            .map(|index| &self.rows[index])
    }

    pub fn row_by_id(&self, id: &RevisionId) -> Option<&LayoutRow> {
        self.rows.iter().find(|row| &row.id == id)
    }

    pub fn edges_from(&self, seq: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |edge| edge.from_row == seq)
    }

    /// Column of the node at `seq` followed by the column of every edge
    /// passing through that row.
    pub fn occupancy(&self, seq: usize) -> Vec<usize> {
        let mut columns: Vec<usize> = self.row(seq).map(|row| row.column).into_iter().collect();
        for edge in &self.edges {
            if let (Some(to), Some(via)) = (edge.to_row, edge.via_column) {
                if edge.from_row < seq && seq < to {
                    columns.push(via);
                }
            }
        }
        columns
    }

    /// Checks parent order and column exclusivity. Returns one message per
    /// violation.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let position: HashMap<usize, usize> = self
            .rows
            .iter()
            .enumerate()
            .map(|(pos, row)| (row.seq, pos))
            .collect();

        for pair in self.rows.windows(2) {
            if pair[0].seq >= pair[1].seq {
                violations.push(format!("rows {} and {} out of order", pair[0].seq, pair[1].seq));
            }
        }

        // closed frame-position intervals per column
        let mut columns: BTreeMap<usize, Vec<(usize, usize, String)>> = BTreeMap::new();
        for (pos, row) in self.rows.iter().enumerate() {
            columns
                .entry(row.column)
                .or_default()
                .push((pos, pos, format!("node {}", row.id)));
        }

        for edge in &self.edges {
            let Some(&from) = position.get(&edge.from_row) else {
                violations.push(format!("edge from missing row {}", edge.from_row));
                continue;
            };
            let Some(to_row) = edge.to_row else {
                continue;
            };
            if to_row <= edge.from_row {
                violations.push(format!("edge {} -> {} points upward", edge.from_row, to_row));
                continue;
            }
            let Some(&to) = position.get(&to_row) else {
                violations.push(format!("edge to missing row {}", to_row));
                continue;
            };
            if let Some(via) = edge.via_column {
                if from + 1 < to {
                    columns
                        .entry(via)
                        .or_default()
                        .push((from + 1, to - 1, format!("edge {} -> {}", edge.from_row, to_row)));
                }
            }
        }

        for (column, mut spans) in columns {
            spans.sort_by_key(|(lo, hi, _)| (*lo, *hi));
            let mut reach: Option<(usize, &str)> = None;
            for (lo, hi, what) in &spans {
                if let Some((end, other)) = reach {
                    if *lo <= end {
                        violations.push(format!("{} overlaps {} in column {}", what, other, column));
                    }
                }
                if reach.map_or(true, |(end, _)| *hi > end) {
                    reach = Some((*hi, what.as_str()));
                }
            }
        }

        violations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PlanKey {
    rows: usize,
    collapsed: Vec<bool>,
}

/// Turns a map, its line table and optional filter matches into frames.
/// Column plans are cached per collapse state so filter changes never move
/// a line. Every collapse state is seeded from the fully expanded plan, so
/// toggling a line leaves the other lines where they were.
#[derive(Debug, Default)]
pub struct LayoutCompiler {
    allocator: ColumnAllocator,
    expanded: Option<(usize, ColumnPlan)>,
    cached: Option<(PlanKey, ColumnPlan)>,
}

impl LayoutCompiler {
    pub fn new(search_horizon: usize) -> Self {
        Self {
            allocator: ColumnAllocator::new(search_horizon),
            expanded: None,
            cached: None,
        }
    }

    /// Drops the cached plans. Needed whenever the map is rebuilt.
    pub fn invalidate(&mut self) {
        self.expanded = None;
        self.cached = None;
    }

    fn plan_for(&mut self, map: &GraphMap, table: &BranchLineTable, collapse: &RowVisibility) -> ColumnPlan {
        let hit = self
            .expanded
            .as_ref()
            .filter(|(rows, _)| *rows == map.len())
            .map(|(_, plan)| plan.clone());
        let expanded = match hit {
            Some(plan) => plan,
            None => {
                let mut all_open = table.clone();
                all_open.expand_all();
                let plan = self.allocator.assign(map, &all_open, &all_open.row_visibility(map));
                self.expanded = Some((map.len(), plan.clone()));
                plan
            }
        };
        if table.lines().iter().any(|line| line.collapsed) {
            self.allocator.assign_seeded(map, table, collapse, Some(&expanded))
        } else {
            expanded
        }
    }

    pub fn compile(
        &mut self,
        map: &GraphMap,
        table: &mut BranchLineTable,
        filter: Option<&FilterMatches>,
        generation: u64,
    ) -> LayoutFrame {
        let collapse = table.row_visibility(map);
        let key = PlanKey {
            rows: map.len(),
            collapsed: table.lines().iter().map(|line| line.collapsed).collect(),
        };
        let hit = self
            .cached
            .as_ref()
            .filter(|(cached_key, _)| *cached_key == key)
            .map(|(_, plan)| plan.clone());
        let plan = match hit {
            Some(plan) => plan,
            None => {
                let plan = self.plan_for(map, table, &collapse);
                self.cached = Some((key, plan.clone()));
                plan
            }
        };
        for index in 0..table.len() {
            table.set_column(LineId(index), plan.column(LineId(index)));
        }

        let visibility = Visibility::compute(map, &collapse, filter);
        let frame_rows: Vec<usize> = visibility.rows().collect();
        let mut position = vec![None; map.len()];
        for (pos, &seq) in frame_rows.iter().enumerate() {
            position[seq] = Some(pos);
        }
        let column_of = |seq: usize| {
            table
                .line_of(seq)
                .and_then(|line| plan.column(line))
                .unwrap_or(0)
        };

        let mut occupancy = plan.occupancy.clone();
        let mut edges = Vec::new();
        for &seq in &frame_rows {
            let Some(row) = map.row(seq) else {
                continue;
            };
            let mut reached: Vec<usize> = Vec::new();
            for (parent_index, link) in row.parents.iter().enumerate() {
                let Some((kind, to_row)) = trace(map, &visibility, link) else {
                    continue;
                };
                if let Some(to) = to_row {
                    if reached.contains(&to) {
                        continue;
                    }
                    reached.push(to);
                }

                let owner = if parent_index == 0 {
                    table.line_of(seq)
                } else {
                    match link {
                        ParentLink::Row(parent) => table
                            .line_of(*parent)
                            .filter(|line| table.line(*line).and_then(|l| l.merged_by) == Some(seq)),
                        ParentLink::Unloaded(_) => None,
                    }
                };
                let end = to_row.unwrap_or(seq);
                let owned = owner.and_then(|line| {
                    let (start, stop) = plan.span(line)?;
                    let column = plan.column(line)?;
                    (start <= seq && end <= stop).then_some(column)
                });

                let from_column = column_of(seq);
                let to_column = to_row.map(column_of);
                let via_column = match (owned, to_row) {
                    (Some(column), _) => Some(column),
                    (None, None) => None,
                    (None, Some(to)) => {
                        let adjacent = matches!(
                            (position[seq], position[to]),
                            (Some(a), Some(b)) if b == a + 1
                        );
                        if adjacent {
                            None
                        } else {
                            Some(occupancy.allocate_lane(from_column, column_of(to), seq + 1, to - 1))
                        }
                    }
                };

                edges.push(Edge {
                    from_row: seq,
                    to_row,
                    parent_index,
                    kind,
                    from_column,
                    via_column,
                    to_column,
                });
            }
        }

        let twisties = place_twisties(map, table, &plan, &frame_rows, &edges, &column_of);

        let mut rows: Vec<LayoutRow> = frame_rows
            .iter()
            .filter_map(|&seq| {
                let row = map.row(seq)?;
                Some(LayoutRow {
                    seq,
                    id: row.id.clone(),
                    column: column_of(seq),
                    line: row.line,
                    merge_depth: row.merge_depth,
                    hollow: visibility.is_hollow(seq),
                    join: collapse.join.get(seq).copied().unwrap_or(false),
                    labels: row.labels.clone(),
                    twisty: None,
                })
            })
            .collect();
        for row in &mut rows {
            row.twisty = twisties.get(&row.seq).cloned();
        }

        let width = rows
            .iter()
            .map(|row| row.column)
            .chain(edges.iter().filter_map(|edge| edge.via_column))
            .chain(rows.iter().filter_map(|row| row.twisty.as_ref().map(|t| t.column)))
            .map(|column| column + 1)
            .max()
            .unwrap_or(0);

        let mut frame = LayoutFrame {
            generation,
            rows,
            edges,
            crossings: plan.crossings.clone(),
            width,
            more_available: map.more_available(),
            truncated: map.is_truncated(),
            errors: map.errors().iter().map(|e| e.to_string()).collect(),
            degraded: false,
        };

        let violations = frame.validate();
        if !violations.is_empty() {
            ErrorReporter::log_error(&EngineError::invariant(violations.join("; ")), "layout");
            error!("Publishing degraded frame for generation {}", generation);
            frame.degraded = true;
        }
        debug_assert!(violations.is_empty(), "layout invariant violated: {:?}", violations);

        debug!(
            "Compiled frame {}: {} rows, {} edges, width {}",
            generation,
            frame.rows.len(),
            frame.edges.len(),
            frame.width
        );
        frame
    }
}

/// Follows `link` to the nearest visible revision along first parents.
/// Returns `None` when the chain ends at a root without one.
fn trace(map: &GraphMap, visibility: &Visibility, link: &ParentLink) -> Option<(EdgeKind, Option<usize>)> {
    let mut seq = match link {
        ParentLink::Unloaded(_) => return Some((EdgeKind::Dangling { hidden: 0 }, None)),
        ParentLink::Row(seq) => *seq,
    };
    if visibility.is_visible(seq) {
        return Some((EdgeKind::Direct, Some(seq)));
    }
    let mut hidden = 0;
    loop {
        hidden += 1;
        match map.row(seq)?.parents.first() {
            None => return None,
            Some(ParentLink::Unloaded(_)) => return Some((EdgeKind::Dangling { hidden }, None)),
            Some(ParentLink::Row(next)) => {
                if visibility.is_visible(*next) {
                    return Some((EdgeKind::Skipped { hidden }, Some(*next)));
                }
                seq = *next;
            }
        }
    }
}

/// Merge rows get a handle for the lines they open. A merged line whose
/// merge row is off screen gets one on its topmost visible row instead.
fn place_twisties(
    map: &GraphMap,
    table: &BranchLineTable,
    plan: &ColumnPlan,
    frame_rows: &[usize],
    edges: &[Edge],
    column_of: &dyn Fn(usize) -> usize,
) -> HashMap<usize, Twisty> {
    let mut twisties: HashMap<usize, Twisty> = HashMap::new();
    let mut handled = vec![false; table.len()];

    for &seq in frame_rows {
        let Some(row) = map.row(seq) else {
            continue;
        };
        let mut targets: Vec<(usize, LineId)> = Vec::new();
        for (parent_index, link) in row.parents.iter().enumerate().skip(1) {
            let ParentLink::Row(parent) = link else {
                continue;
            };
            let Some(line) = table.line_of(*parent) else {
                continue;
            };
            let opens = table
                .line(line)
                .is_some_and(|l| l.head() == Some(*parent) && l.merged_by == Some(seq));
            if opens && !targets.iter().any(|(_, t)| *t == line) {
                targets.push((parent_index, line));
            }
        }
        let Some(&(first_index, first_line)) = targets.first() else {
            continue;
        };
        let column = plan
            .column(first_line)
            .or_else(|| {
                edges
                    .iter()
                    .find(|e| e.from_row == seq && e.parent_index == first_index)
                    .and_then(|e| e.via_column)
            })
            .unwrap_or_else(|| column_of(seq));
        for (_, line) in &targets {
            handled[line.0] = true;
        }
        twisties.insert(
            seq,
            Twisty {
                column,
                expanded: targets.iter().all(|(_, line)| !table.is_collapsed(*line)),
                targets: targets.into_iter().map(|(_, line)| line).collect(),
            },
        );
    }

    for &seq in frame_rows {
        let Some(line) = table.line_of(seq) else {
            continue;
        };
        if handled[line.0] || table.is_mainline(line) {
            continue;
        }
        let Some(branch) = table.line(line) else {
            continue;
        };
        if !branch.is_collapsible() {
            continue;
        }
        handled[line.0] = true;
        let expanded = !branch.collapsed;
        twisties
            .entry(seq)
            .and_modify(|twisty| {
                twisty.targets.push(line);
                twisty.expanded &= expanded;
            })
            .or_insert_with(|| Twisty {
                column: column_of(seq),
                expanded,
                targets: vec![line],
            });
    }

    twisties
}
