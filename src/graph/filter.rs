use crate::graph::builder::{GraphMap, ParentLink};
use crate::graph::lines::RowVisibility;
use crate::models::Revision;
use crate::provider::{ProviderError, RevisionProvider};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which ancestry keeps a non-matching merge visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AncestryMode {
    /// Only matches on a row's own first-parent chain count.
    FirstParent,
    /// A merge stays (hollow) when anything it merged is visible.
    #[default]
    Full,
}

#[derive(Debug, Clone)]
pub enum SearchPattern {
    Text(String),
    Regex(Regex),
}

impl PartialEq for SearchPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SearchPattern::Text(a), SearchPattern::Text(b)) => a == b,
            (SearchPattern::Regex(a), SearchPattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl SearchPattern {
    fn matches(&self, text: &str) -> bool {
        match self {
            SearchPattern::Text(needle) => text.to_lowercase().contains(&needle.to_lowercase()),
            SearchPattern::Regex(regex) => regex.is_match(text),
        }
    }
}

/// Predicate over revision metadata plus an optional path restriction.
/// Criteria combine with AND; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub search: Option<SearchPattern>,
    pub author: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub paths: Vec<String>,
    pub ancestry: AncestryMode,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.search = (!text.is_empty()).then_some(SearchPattern::Text(text));
        self
    }

    /// Case-insensitive regular expression search.
    pub fn with_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.search = Some(SearchPattern::Regex(regex));
        Ok(self)
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        let author = author.into();
        self.author = (!author.is_empty()).then_some(author);
        self
    }

    pub fn with_date_range(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim_end_matches('/');
        if !trimmed.is_empty() {
            self.paths.push(trimmed.to_string());
        }
        self
    }

    pub fn with_ancestry(mut self, ancestry: AncestryMode) -> Self {
        self.ancestry = ancestry;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.search.is_none()
            && self.author.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.paths.is_empty()
    }

    pub fn needs_paths(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn matches_metadata(&self, revision: &Revision) -> bool {
        if let Some(search) = &self.search {
            let hit = search.matches(&revision.message)
                || revision.tags.iter().any(|tag| search.matches(tag))
                || revision
                    .branch_nick
                    .as_deref()
                    .is_some_and(|nick| search.matches(nick))
                || search.matches(&revision.id.to_string());
            if !hit {
                return false;
            }
        }

        if let Some(author) = &self.author {
            let needle = author.to_lowercase();
            let hit = revision.author.to_lowercase().contains(&needle)
                || revision
                    .committer
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }

        if self.since.is_some() || self.until.is_some() {
            let Some(at) = revision.committed_at() else {
                return false;
            };
            if self.since.is_some_and(|since| at < since) || self.until.is_some_and(|until| at > until) {
                return false;
            }
        }

        true
    }

    /// A revision touches a filter path when it changed that file or
    /// anything below that directory.
    pub fn matches_paths(&self, changed: &[String]) -> bool {
        if self.paths.is_empty() {
            return true;
        }
        changed.iter().any(|changed| {
            self.paths.iter().any(|path| {
                changed == path
                    || (changed.len() > path.len()
                        && changed.starts_with(path.as_str())
                        && changed.as_bytes()[path.len()] == b'/')
            })
        })
    }
}

/// Per-row match results plus the policy needed to turn them into
/// visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMatches {
    pub matched: Vec<bool>,
    pub ancestry: AncestryMode,
    pub min_elided_run: usize,
}

impl FilterMatches {
    /// Evaluates `filter` over the whole map in one go.
    pub fn evaluate<P: RevisionProvider + ?Sized>(
        map: &GraphMap,
        provider: &P,
        filter: &Filter,
        min_elided_run: usize,
    ) -> Result<Self, ProviderError> {
        let mut job = PathMatchJob::new(filter.clone());
        while !job.step(map, provider, usize::MAX)? {}
        Ok(job.into_matches(min_elided_run))
    }
}

/// Filter evaluation in bounded units. Changed-path lookups go through the
/// provider, so a unit may fail transiently and be retried.
#[derive(Debug, Clone)]
pub struct PathMatchJob {
    filter: Filter,
    cursor: usize,
    matched: Vec<bool>,
    paths_supported: Option<bool>,
}

impl PathMatchJob {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            cursor: 0,
            matched: Vec::new(),
            paths_supported: None,
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.cursor, self.matched.len())
    }

    /// Returns `true` once every row has been evaluated.
    pub fn step<P: RevisionProvider + ?Sized>(
        &mut self,
        map: &GraphMap,
        provider: &P,
        unit: usize,
    ) -> Result<bool, ProviderError> {
        if self.matched.len() != map.len() {
            self.matched = vec![false; map.len()];
            self.cursor = 0;
        }
        let supported = *self.paths_supported.get_or_insert_with(|| {
            let supported = provider.supports_changed_paths();
            if self.filter.needs_paths() && !supported {
                warn!("Provider cannot report changed paths; ignoring path filter");
            }
            supported
        });

        let end = self.cursor.saturating_add(unit.max(1)).min(map.len());
        while self.cursor < end {
            let seq = self.cursor;
            let Some(revision) = map.revision_at(seq) else {
                self.cursor += 1;
                continue;
            };
            let mut hit = self.filter.matches_metadata(revision);
            if hit && supported && self.filter.needs_paths() {
                match provider.changed_paths(&revision.id) {
                    Ok(paths) => hit = self.filter.matches_paths(&paths),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        debug!("No changed paths for {}: {}", revision.id.short(), e);
                        hit = false;
                    }
                }
            }
            self.matched[seq] = hit;
            self.cursor += 1;
        }

        let done = self.cursor >= map.len();
        if done {
            debug!(
                "Filter matched {} of {} rows",
                self.matched.iter().filter(|m| **m).count(),
                map.len()
            );
        }
        Ok(done)
    }

    pub fn into_matches(self, min_elided_run: usize) -> FilterMatches {
        FilterMatches {
            matched: self.matched,
            ancestry: self.filter.ancestry,
            min_elided_run,
        }
    }
}

/// Final per-row visibility: collapse first, then filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visibility {
    pub visible: Vec<bool>,
    /// Visible without matching the filter.
    pub hollow: Vec<bool>,
    pub join: Vec<bool>,
}

impl Visibility {
    pub fn compute(map: &GraphMap, rows: &RowVisibility, filter: Option<&FilterMatches>) -> Self {
        let n = map.len();
        let kept = |seq: usize| rows.kept.get(seq).copied().unwrap_or(false);
        let join = (0..n).map(|seq| rows.join.get(seq).copied().unwrap_or(false)).collect();

        let Some(filter) = filter else {
            return Self {
                visible: (0..n).map(kept).collect(),
                hollow: vec![false; n],
                join,
            };
        };

        let matched = |seq: usize| filter.matched.get(seq).copied().unwrap_or(true);
        let mut visible: Vec<bool> = (0..n).map(|seq| kept(seq) && matched(seq)).collect();
        let mut hollow = vec![false; n];
        let rows_of = map.rows();

        if filter.ancestry == AncestryMode::Full {
            // below[seq]: something visible at or under seq on its own line
            let mut below = vec![false; n];
            for seq in (0..n).rev() {
                let row = &rows_of[seq];
                if kept(seq) && !visible[seq] {
                    let merges_visible = row.parents.iter().skip(1).any(|p| match p {
                        ParentLink::Row(parent) => below[*parent],
                        ParentLink::Unloaded(_) => false,
                    });
                    if merges_visible {
                        visible[seq] = true;
                        hollow[seq] = true;
                    }
                }
                let under = row
                    .first_parent()
                    .filter(|fp| rows_of[*fp].line == row.line)
                    .is_some_and(|fp| below[fp]);
                below[seq] = visible[seq] || under;
            }
        }

        // nearest matching descendant; two different ones make a join
        let mut nearest: Vec<Option<usize>> = vec![None; n];
        for seq in 0..n {
            if visible[seq] && !hollow[seq] {
                nearest[seq] = Some(seq);
                continue;
            }
            let mut found = None;
            let mut distinct = false;
            for &child in &rows_of[seq].children {
                match (found, nearest[child]) {
                    (None, Some(rep)) => found = Some(rep),
                    (Some(seen), Some(rep)) if seen != rep => distinct = true,
                    _ => {}
                }
            }
            if distinct && kept(seq) {
                if !visible[seq] {
                    visible[seq] = true;
                    hollow[seq] = true;
                }
                nearest[seq] = Some(seq);
            } else {
                nearest[seq] = found;
            }
        }

        if filter.min_elided_run > 1 {
            let anchors = visible.clone();
            for seq in (0..n).filter(|&seq| anchors[seq]) {
                let mut run = Vec::new();
                let mut cursor = rows_of[seq].first_parent();
                while let Some(parent) = cursor {
                    if anchors[parent] {
                        for &bridged in &run {
                            visible[bridged] = true;
                            hollow[bridged] = true;
                        }
                        break;
                    }
                    if !kept(parent) {
                        break;
                    }
                    run.push(parent);
                    if run.len() >= filter.min_elided_run {
                        break;
                    }
                    cursor = rows_of[parent].first_parent();
                }
            }
        }

        Self {
            visible,
            hollow,
            join,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.visible
            .iter()
            .enumerate()
            .filter_map(|(seq, visible)| visible.then_some(seq))
    }

    pub fn is_visible(&self, seq: usize) -> bool {
        self.visible.get(seq).copied().unwrap_or(false)
    }

    pub fn is_hollow(&self, seq: usize) -> bool {
        self.hollow.get(seq).copied().unwrap_or(false)
    }
}
