use crate::graph::lines::{LineId, LineKey};
use crate::models::{BranchTipSet, Revision, RevisionId, TipHead};
use crate::provider::{ProviderError, RevisionProvider};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Default number of revisions accepted per call to [`BuildJob::step`].
pub const DEFAULT_WORK_UNIT: usize = 100;

/// Reference from a row to one of its parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParentLink {
    /// Loaded parent, by sequence index.
    Row(usize),
    /// Parent outside the loaded set.
    Unloaded(RevisionId),
}

/// One entry of the flattened sequence. Columns are assigned later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphRow {
    pub seq: usize,
    pub id: RevisionId,
    pub line: LineId,
    pub merge_depth: u32,
    /// Distinct parents, first parent first.
    pub parents: Vec<ParentLink>,
    /// Children by ascending sequence index.
    pub children: Vec<usize>,
    /// Reached by an edge from a different line.
    pub join_point: bool,
    /// Tip labels pointing at this revision.
    pub labels: Vec<String>,
}

impl GraphRow {
    pub fn first_parent(&self) -> Option<usize> {
        match self.parents.first() {
            Some(ParentLink::Row(seq)) => Some(*seq),
            _ => None,
        }
    }
}

/// Where a line came from: a tip, or a merge whose non-first parent was not
/// yet owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineOrigin {
    pub key: LineKey,
    pub tip_index: usize,
    pub labels: Vec<String>,
    pub head: RevisionId,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadError {
    pub revision: Option<RevisionId>,
    pub message: String,
}

impl LoadError {
    pub fn new(revision: Option<RevisionId>, message: impl Into<String>) -> Self {
        Self {
            revision,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.revision {
            Some(id) => write!(f, "{}: {}", id.short(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Ordering key: owning tip first, then newest, then id bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    tip_index: usize,
    newest: Reverse<i64>,
    id: RevisionId,
}

/// Flattened, topologically ordered view of the loaded ancestry.
#[derive(Debug, Clone, Default)]
pub struct GraphMap {
    heads: Vec<TipHead>,
    tip_count: usize,

    // discovery
    seed_cursor: usize,
    queue: BinaryHeap<Reverse<QueueKey>>,
    pending_parents: VecDeque<(RevisionId, usize)>,
    staged: HashMap<RevisionId, Revision>,
    seen: HashSet<RevisionId>,
    next_provisional: usize,
    accepted: Vec<RevisionId>,
    revisions: HashMap<RevisionId, Revision>,
    aborted: bool,

    // ordering
    rows: Vec<GraphRow>,
    index: HashMap<RevisionId, usize>,
    owner: HashMap<RevisionId, LineId>,
    tails: Vec<RevisionId>,
    origins: Vec<LineOrigin>,
    synthesized: usize,

    frontier: BTreeSet<RevisionId>,
    more_available: bool,
    truncated: bool,
    errors: Vec<LoadError>,
}

impl GraphMap {
    pub fn new(tips: &BranchTipSet) -> Self {
        Self {
            heads: tips.visible_heads(),
            tip_count: tips.len(),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> &[GraphRow] {
        &self.rows
    }

    pub fn row(&self, seq: usize) -> Option<&GraphRow> {
        self.rows.get(seq)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn seq_of(&self, id: &RevisionId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn revision(&self, id: &RevisionId) -> Option<&Revision> {
        self.revisions.get(id)
    }

    pub fn revision_at(&self, seq: usize) -> Option<&Revision> {
        self.rows.get(seq).and_then(|row| self.revisions.get(&row.id))
    }

    pub fn heads(&self) -> &[TipHead] {
        &self.heads
    }

    pub fn origins(&self) -> &[LineOrigin] {
        &self.origins
    }

    /// Parents referenced by loaded revisions but not loaded themselves.
    pub fn frontier(&self) -> &BTreeSet<RevisionId> {
        &self.frontier
    }

    pub fn more_available(&self) -> bool {
        self.more_available
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn errors(&self) -> &[LoadError] {
        &self.errors
    }

    pub fn loaded_count(&self) -> usize {
        self.revisions.len()
    }

    pub fn record_error(&mut self, error: LoadError) {
        warn!("Revision graph truncated: {}", error);
        self.truncated = true;
        self.errors.push(error);
    }

    fn stage(&mut self, revision: Revision, tip_index: usize) {
        self.queue.push(Reverse(QueueKey {
            tip_index,
            newest: Reverse(revision.timestamp),
            id: revision.id.clone(),
        }));
        self.staged.insert(revision.id.clone(), revision);
    }

    fn abort(&mut self, error: LoadError) {
        self.aborted = true;
        self.record_error(error);
    }

    fn seed<P: RevisionProvider + ?Sized>(&mut self, provider: &P) -> Result<(), ProviderError> {
        while self.seed_cursor < self.heads.len() {
            let head = self.heads[self.seed_cursor].clone();
            if !self.seen.contains(&head.id) {
                match provider.metadata(&head.id) {
                    Ok(revision) => {
                        self.seen.insert(head.id.clone());
                        self.stage(revision, head.tip_index);
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        self.record_error(LoadError::new(
                            Some(head.id.clone()),
                            format!("tip {} skipped: {}", head.labels.join(", "), e),
                        ));
                    }
                }
            }
            self.seed_cursor += 1;
        }
        Ok(())
    }

    /// Runs the priority walk until `budget` revisions are accepted, the
    /// ancestry is exhausted, or `unit` revisions were accepted in this call.
    /// Returns `true` once discovery is over.
    fn discover<P: RevisionProvider + ?Sized>(
        &mut self,
        provider: &P,
        budget: usize,
        unit: usize,
    ) -> Result<bool, ProviderError> {
        if self.aborted {
            return Ok(true);
        }
        self.seed(provider)?;
        // with nothing accepted the frontier would come out empty
        let budget = budget.max(1);

        let mut accepted_now = 0;
        loop {
            if self.revisions.len() >= budget {
                return Ok(true);
            }
            while let Some((id, tip_index)) = self.pending_parents.front().cloned() {
                match provider.metadata(&id) {
                    Ok(revision) => {
                        self.pending_parents.pop_front();
                        self.stage(revision, tip_index);
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        self.pending_parents.pop_front();
                        self.abort(LoadError::new(Some(id), e.to_string()));
                        return Ok(true);
                    }
                }
            }
            if accepted_now >= unit {
                return Ok(false);
            }
            let Some(Reverse(key)) = self.queue.pop() else {
                return Ok(true);
            };
            let Some(revision) = self.staged.remove(&key.id) else {
                continue;
            };
            for (i, parent) in revision.parents.iter().enumerate() {
                if self.seen.insert(parent.clone()) {
                    let tip_index = if i == 0 {
                        key.tip_index
                    } else {
                        self.next_provisional += 1;
                        self.tip_count + self.next_provisional - 1
                    };
                    self.pending_parents.push_back((parent.clone(), tip_index));
                }
            }
            self.accepted.push(key.id.clone());
            self.revisions.insert(key.id, revision);
            accepted_now += 1;
        }
    }

    fn finish_discovery(&mut self) {
        self.frontier = self
            .revisions
            .values()
            .flat_map(|rev| rev.parents.iter())
            .filter(|p| !self.revisions.contains_key(*p))
            .cloned()
            .collect();
        self.more_available = !self.aborted && !self.frontier.is_empty();
        info!(
            "Loaded {} revisions ({} on the frontier, more available: {})",
            self.revisions.len(),
            self.frontier.len(),
            self.more_available
        );
    }

    /// Orders every accepted revision from scratch.
    fn flatten(&mut self) {
        self.rows.clear();
        self.index.clear();
        self.owner.clear();
        self.tails.clear();
        self.origins.clear();
        self.synthesized = 0;

        for head in self.heads.clone() {
            if !self.revisions.contains_key(&head.id) || self.owner.contains_key(&head.id) {
                continue;
            }
            let key = LineKey::Tip(head.labels.first().cloned().unwrap_or_default());
            self.open_line(key, head.tip_index, head.labels.clone(), head.id.clone(), 0);
        }

        let pending = self.accepted.clone();
        self.order(&pending);
        self.link();
    }

    /// Appends newly accepted revisions after the existing rows when none of
    /// them has an already ordered parent; re-flattens otherwise.
    fn extend_order(&mut self, previously_accepted: usize) {
        let new_ids: Vec<RevisionId> = self.accepted[previously_accepted.min(self.accepted.len())..].to_vec();
        if new_ids.is_empty() {
            self.link();
            return;
        }
        let is_head = |id: &RevisionId| self.heads.iter().any(|h| &h.id == id);
        let touches_old = new_ids.iter().any(|id| {
            is_head(id)
                || self
                    .revisions
                    .get(id)
                    .is_some_and(|rev| rev.parents.iter().any(|p| self.index.contains_key(p)))
        });
        if self.rows.is_empty() || touches_old {
            debug!("Re-flattening {} revisions", self.revisions.len());
            self.flatten();
            return;
        }

        debug!("Appending {} revisions after {} rows", new_ids.len(), self.rows.len());
        for line in 0..self.origins.len() {
            let next = self
                .revisions
                .get(&self.tails[line])
                .and_then(|rev| rev.parents.first())
                .cloned();
            if let Some(next) = next {
                self.claim_chain(LineId(line), next);
            }
        }
        for seq in 0..self.rows.len() {
            let id = self.rows[seq].id.clone();
            let depth = self.origins[self.rows[seq].line.0].depth;
            let parents = self
                .revisions
                .get(&id)
                .map(|rev| rev.parents.clone())
                .unwrap_or_default();
            for parent in parents.iter().skip(1) {
                self.open_merge_line(parent, depth + 1);
            }
        }
        self.order(&new_ids);
        self.link();
    }

    fn open_line(
        &mut self,
        key: LineKey,
        tip_index: usize,
        labels: Vec<String>,
        head: RevisionId,
        depth: u32,
    ) -> LineId {
        let line = LineId(self.origins.len());
        self.origins.push(LineOrigin {
            key,
            tip_index,
            labels,
            head: head.clone(),
            depth,
        });
        self.tails.push(head.clone());
        self.claim_chain(line, head);
        line
    }

    /// Opens a line at `parent` if it is loaded and still unowned.
    fn open_merge_line(&mut self, parent: &RevisionId, depth: u32) {
        if !self.revisions.contains_key(parent) || self.owner.contains_key(parent) {
            return;
        }
        let tip_index = self.tip_count + self.synthesized;
        self.synthesized += 1;
        self.open_line(
            LineKey::Merge(parent.clone()),
            tip_index,
            Vec::new(),
            parent.clone(),
            depth,
        );
    }

    /// Claims the unowned first-parent chain starting at `start`.
    fn claim_chain(&mut self, line: LineId, start: RevisionId) {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if self.owner.contains_key(&id) {
                break;
            }
            let Some(revision) = self.revisions.get(&id) else {
                break;
            };
            cursor = revision.parents.first().cloned();
            self.owner.insert(id.clone(), line);
            self.tails[line.0] = id;
        }
    }

    fn ready_key(&mut self, id: &RevisionId) -> QueueKey {
        if !self.owner.contains_key(id) {
            // only reachable when a revision lost every child to a budget cut
            self.open_merge_line(id, 1);
        }
        let tip_index = self
            .owner
            .get(id)
            .and_then(|line| self.origins.get(line.0))
            .map(|origin| origin.tip_index)
            .unwrap_or(usize::MAX);
        let timestamp = self.revisions.get(id).map(|rev| rev.timestamp).unwrap_or(0);
        QueueKey {
            tip_index,
            newest: Reverse(timestamp),
            id: id.clone(),
        }
    }

    /// Kahn's sort over `ids`, emitting rows after the existing ones.
    fn order(&mut self, ids: &[RevisionId]) {
        let mut indegree: HashMap<RevisionId, usize> = ids.iter().map(|id| (id.clone(), 0)).collect();
        for id in ids {
            if let Some(revision) = self.revisions.get(id) {
                for parent in distinct(&revision.parents) {
                    if let Some(count) = indegree.get_mut(parent) {
                        *count += 1;
                    }
                }
            }
        }

        let mut ready = BinaryHeap::new();
        for id in ids {
            if indegree.get(id) == Some(&0) {
                let key = self.ready_key(id);
                ready.push(Reverse(key));
            }
        }

        while let Some(Reverse(key)) = ready.pop() {
            let id = key.id;
            let seq = self.rows.len();
            let line = self.owner.get(&id).copied().unwrap_or(LineId(0));
            let depth = self.origins.get(line.0).map(|o| o.depth).unwrap_or(0);
            self.index.insert(id.clone(), seq);
            self.rows.push(GraphRow {
                seq,
                id: id.clone(),
                line,
                merge_depth: depth,
                parents: Vec::new(),
                children: Vec::new(),
                join_point: false,
                labels: Vec::new(),
            });

            let parents = self
                .revisions
                .get(&id)
                .map(|rev| rev.parents.clone())
                .unwrap_or_default();
            for (i, parent) in distinct(&parents).into_iter().enumerate() {
                if i > 0 {
                    self.open_merge_line(parent, depth + 1);
                }
                if let Some(count) = indegree.get_mut(parent) {
                    *count -= 1;
                    if *count == 0 {
                        let key = self.ready_key(parent);
                        ready.push(Reverse(key));
                    }
                }
            }
        }

        if self.rows.len() != self.revisions.len() {
            warn!(
                "Ordered {} of {} revisions; the ancestry is not acyclic",
                self.rows.len(),
                self.revisions.len()
            );
        }
    }

    /// Resolves parent/child adjacency, join points and labels.
    fn link(&mut self) {
        for seq in 0..self.rows.len() {
            let parents = self
                .revisions
                .get(&self.rows[seq].id)
                .map(|rev| {
                    distinct(&rev.parents)
                        .into_iter()
                        .map(|p| match self.index.get(p) {
                            Some(&row) => ParentLink::Row(row),
                            None => ParentLink::Unloaded(p.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let row = &mut self.rows[seq];
            row.parents = parents;
            row.children.clear();
            row.labels.clear();
            row.join_point = false;
        }

        for seq in 0..self.rows.len() {
            let line = self.rows[seq].line;
            let parents: Vec<usize> = self.rows[seq]
                .parents
                .iter()
                .filter_map(|p| match p {
                    ParentLink::Row(row) => Some(*row),
                    ParentLink::Unloaded(_) => None,
                })
                .collect();
            for parent in parents {
                let target = &mut self.rows[parent];
                target.children.push(seq);
                if target.line != line {
                    target.join_point = true;
                }
            }
        }

        for head in &self.heads {
            if let Some(&seq) = self.index.get(&head.id) {
                self.rows[seq].labels.extend(head.labels.iter().cloned());
            }
        }
    }
}

fn distinct(parents: &[RevisionId]) -> Vec<&RevisionId> {
    let mut out: Vec<&RevisionId> = Vec::with_capacity(parents.len());
    for parent in parents {
        if !out.contains(&parent) {
            out.push(parent);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Complete,
}

/// Resumable load of a [`GraphMap`], one bounded unit per [`step`](Self::step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    budget: usize,
    extend_from: Option<usize>,
}

impl BuildJob {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            extend_from: None,
        }
    }

    /// Continues a finished map with `extra` more revisions.
    pub fn extend(map: &GraphMap, extra: usize) -> Self {
        Self {
            budget: map.loaded_count().saturating_add(extra),
            extend_from: Some(map.accepted.len()),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn raise_budget(&mut self, extra: usize) {
        self.budget = self.budget.saturating_add(extra);
    }

    pub fn step<P: RevisionProvider + ?Sized>(
        &mut self,
        map: &mut GraphMap,
        provider: &P,
        unit: usize,
    ) -> Result<BuildStatus, ProviderError> {
        if !map.discover(provider, self.budget, unit.max(1))? {
            debug!("Discovery unit done, {} revisions accepted", map.loaded_count());
            return Ok(BuildStatus::Pending);
        }
        map.finish_discovery();
        match self.extend_from {
            Some(previous) => map.extend_order(previous),
            None => map.flatten(),
        }
        Ok(BuildStatus::Complete)
    }
}

/// Synchronous driver over [`BuildJob`].
pub struct GraphBuilder<'a, P: ?Sized> {
    provider: &'a P,
    budget: usize,
    work_unit: usize,
}

impl<'a, P: RevisionProvider + ?Sized> GraphBuilder<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self {
            provider,
            budget: usize::MAX,
            work_unit: DEFAULT_WORK_UNIT,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_work_unit(mut self, work_unit: usize) -> Self {
        self.work_unit = work_unit;
        self
    }

    /// Loads and flattens the ancestry of `tips`. Only transient provider
    /// failures are returned; anything else ends up in [`GraphMap::errors`].
    pub fn build(&self, tips: &BranchTipSet) -> Result<GraphMap, ProviderError> {
        let mut map = GraphMap::new(tips);
        let mut job = BuildJob::new(self.budget);
        while job.step(&mut map, self.provider, self.work_unit)? == BuildStatus::Pending {}
        Ok(map)
    }

    pub fn extend(&self, map: &mut GraphMap, extra: usize) -> Result<(), ProviderError> {
        let mut job = BuildJob::extend(map, extra);
        while job.step(map, self.provider, self.work_unit)? == BuildStatus::Pending {}
        Ok(())
    }
}
