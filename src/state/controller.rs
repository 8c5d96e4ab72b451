use crate::graph::{
    BranchLineTable, BuildJob, BuildStatus, Filter, FilterMatches, GraphMap, LayoutCompiler, LayoutFrame,
    LineId, LoadError, PathMatchJob,
};
use crate::models::{BranchTipSet, Revision, RevisionId};
use crate::provider::{ProviderError, RevisionProvider};
use crate::state::config::EngineConfig;
use crate::state::error_handling::{Backoff, EngineError, ErrorReporter};
use crate::state::persist::CollapseStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receives every published frame.
pub trait Renderer {
    fn apply_frame(&mut self, frame: Arc<LayoutFrame>);
}

/// Renderer that drops frames; read [`StateController::frame`] instead.
impl Renderer for () {
    fn apply_frame(&mut self, _frame: Arc<LayoutFrame>) {}
}

/// Outcome of one [`StateController::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Nothing queued.
    Idle,
    /// A unit of work ran (or stale work was dropped); call again.
    Progress,
    /// The provider is failing; call again after this delay.
    Backoff(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Load,
    Match,
    Layout,
}

#[derive(Debug)]
enum Job {
    Load {
        generation: u64,
        job: BuildJob,
        map: GraphMap,
    },
    Match {
        generation: u64,
        job: PathMatchJob,
    },
    Layout {
        generation: u64,
    },
}

impl Job {
    fn generation(&self) -> u64 {
        match self {
            Job::Load { generation, .. } | Job::Match { generation, .. } | Job::Layout { generation } => *generation,
        }
    }

    fn kind(&self) -> JobKind {
        match self {
            Job::Load { .. } => JobKind::Load,
            Job::Match { .. } => JobKind::Match,
            Job::Layout { .. } => JobKind::Layout,
        }
    }
}

/// Single-writer coordinator of the layout pipeline.
///
/// Events queue the minimum work they invalidate; [`pump`](Self::pump) runs
/// one bounded unit at a time so the caller's loop stays responsive.
pub struct StateController<P, R> {
    provider: P,
    renderer: R,
    config: EngineConfig,
    store: Option<Box<dyn CollapseStore>>,

    tips: BranchTipSet,
    filter: Filter,
    map: GraphMap,
    lines: BranchLineTable,
    matches: Option<FilterMatches>,
    compiler: LayoutCompiler,

    generation: u64,
    // jobs below these generations are retired
    load_floor: u64,
    match_floor: u64,
    layout_floor: u64,
    queue: VecDeque<Job>,
    backoff: Backoff,
    retry_at: Option<Instant>,

    selection: Option<RevisionId>,
    frame: Option<Arc<LayoutFrame>>,
}

impl<P: RevisionProvider, R: Renderer> StateController<P, R> {
    pub fn new(provider: P, renderer: R, config: EngineConfig) -> Self {
        Self {
            provider,
            renderer,
            compiler: LayoutCompiler::new(config.column_search_horizon),
            backoff: Backoff::new(config.retry.clone()),
            config,
            store: None,
            tips: BranchTipSet::new(),
            filter: Filter::default(),
            map: GraphMap::default(),
            lines: BranchLineTable::default(),
            matches: None,
            generation: 0,
            load_floor: 0,
            match_floor: 0,
            layout_floor: 0,
            queue: VecDeque::new(),
            retry_at: None,
            selection: None,
            frame: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn CollapseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tips(&self) -> &BranchTipSet {
        &self.tips
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn map(&self) -> &GraphMap {
        &self.map
    }

    pub fn lines(&self) -> &BranchLineTable {
        &self.lines
    }

    /// Latest generation handed out by an event.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last published frame.
    pub fn frame(&self) -> Option<Arc<LayoutFrame>> {
        self.frame.clone()
    }

    pub fn selection(&self) -> Option<&RevisionId> {
        self.selection.as_ref()
    }

    pub fn selected_revision(&self) -> Option<&Revision> {
        self.selection.as_ref().and_then(|id| self.map.revision(id))
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn is_stale(&self, job: &Job) -> bool {
        let floor = match job.kind() {
            JobKind::Load => self.load_floor,
            JobKind::Match => self.match_floor,
            JobKind::Layout => self.layout_floor,
        };
        job.generation() < floor
    }

    fn has_live_load(&self) -> bool {
        self.queue
            .iter()
            .any(|job| job.kind() == JobKind::Load && !self.is_stale(job))
    }

    fn queue_layout(&mut self) {
        let generation = self.next_generation();
        self.layout_floor = generation;
        self.queue.push_back(Job::Layout { generation });
    }

    /// Replaces the tip set and reloads from scratch. Everything queued is
    /// retired; the current frame stays up until the new one is ready.
    pub fn on_tips_changed(&mut self, tips: BranchTipSet) {
        let generation = self.next_generation();
        self.load_floor = generation;
        self.match_floor = generation;
        self.layout_floor = generation;
        info!("Tips changed, loading generation {} ({} tips)", generation, tips.len());
        let map = GraphMap::new(&tips);
        self.tips = tips;
        self.queue.push_back(Job::Load {
            generation,
            job: BuildJob::new(self.config.max_revisions),
            map,
        });
    }

    /// Loads `extra` more revisions beyond the current frontier.
    pub fn on_revisions_added(&mut self, extra: usize) {
        let floor = self.load_floor;
        let live = self
            .queue
            .iter_mut()
            .find_map(|job| match job {
                Job::Load { generation, job, .. } if *generation >= floor => Some(job),
                _ => None,
            });
        if let Some(job) = live {
            job.raise_budget(extra);
            debug!("Raised live load budget to {}", job.budget());
            return;
        }

        let generation = self.next_generation();
        self.load_floor = generation;
        self.match_floor = generation;
        self.layout_floor = generation;
        debug!("Extending {} loaded revisions by {}", self.map.loaded_count(), extra);
        self.queue.push_back(Job::Load {
            generation,
            job: BuildJob::extend(&self.map, extra),
            map: self.map.clone(),
        });
    }

    /// "Load more": extends by the configured step.
    pub fn request_more(&mut self) {
        if !self.map.more_available() && !self.has_live_load() {
            debug!("Nothing more to load");
            return;
        }
        self.on_revisions_added(self.config.extend_step);
    }

    /// Replaces the filter. A newer filter supersedes one still being
    /// evaluated.
    pub fn on_filter_changed(&mut self, filter: Filter) {
        if filter == self.filter {
            return;
        }
        let generation = self.next_generation();
        self.match_floor = generation;
        self.layout_floor = generation;
        self.filter = filter;
        self.matches = None;
        debug!("Filter changed at generation {}", generation);

        if self.has_live_load() {
            // the finished load evaluates the current filter
            return;
        }
        if self.filter.is_empty() {
            self.queue.push_back(Job::Layout { generation });
        } else {
            self.queue.push_back(Job::Match {
                generation,
                job: PathMatchJob::new(self.filter.clone()),
            });
        }
    }

    /// Flips the collapse flag of `line`. Returns the new state.
    pub fn on_collapse_toggled(&mut self, line: LineId) -> bool {
        let before = self.lines.is_collapsed(line);
        let collapsed = self.lines.toggle(line);
        if collapsed != before {
            self.persist(&[line]);
            self.queue_layout();
        }
        collapsed
    }

    /// Applies the twisty on the row at `seq` of the last frame: collapses
    /// its targets when all are expanded, expands them otherwise.
    pub fn on_twisty_clicked(&mut self, seq: usize) -> bool {
        let Some(twisty) = self
            .frame
            .as_ref()
            .and_then(|frame| frame.row(seq))
            .and_then(|row| row.twisty.clone())
        else {
            debug!("No twisty on row {}", seq);
            return false;
        };
        let collapse = twisty.expanded;
        let changed: Vec<LineId> = twisty
            .targets
            .iter()
            .copied()
            .filter(|line| self.lines.set_collapsed(*line, collapse))
            .collect();
        if changed.is_empty() {
            return false;
        }
        self.persist(&changed);
        self.queue_layout();
        true
    }

    /// Selects the row at `seq`.
    pub fn on_row_clicked(&mut self, seq: usize) -> Option<&Revision> {
        let id = self.map.row(seq)?.id.clone();
        debug!("Selected {}", id.short());
        self.selection = Some(id);
        self.selected_revision()
    }

    /// Expands whatever hides `id`. Returns `false` when it is not loaded.
    pub fn reveal(&mut self, id: &RevisionId) -> bool {
        let Some(seq) = self.map.seq_of(id) else {
            return false;
        };
        let changed = self.lines.reveal(seq);
        if !changed.is_empty() {
            self.persist(&changed);
            self.queue_layout();
        }
        true
    }

    pub fn expand_all(&mut self) {
        let changed = self.lines.expand_all();
        if !changed.is_empty() {
            self.persist(&changed);
            self.queue_layout();
        }
    }

    fn persist(&mut self, lines: &[LineId]) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        for id in lines {
            if let Some(line) = self.lines.line(*id) {
                store.store(&line.key, line.collapsed);
            }
        }
        if let Err(e) = store.flush() {
            ErrorReporter::log_error(&e, "saving collapse flags");
            if !e.is_recoverable() {
                warn!("Collapse flags will no longer be saved");
                self.store = None;
            }
        }
    }

    /// Runs one unit of queued work.
    pub fn pump(&mut self) -> PumpStatus {
        let mut dropped = 0;
        while let Some(job) = self.queue.front() {
            if !self.is_stale(job) {
                break;
            }
            let generation = job.generation();
            self.queue.pop_front();
            ErrorReporter::log_error(&EngineError::cancelled(generation), "work queue");
            dropped += 1;
        }
        if dropped > 0 {
            // a pending retry belonged to the dropped job
            self.retry_at = None;
            self.backoff.reset();
            return PumpStatus::Progress;
        }

        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if now < at {
                return PumpStatus::Backoff(at - now);
            }
            self.retry_at = None;
        }

        let Some(job) = self.queue.pop_front() else {
            return PumpStatus::Idle;
        };
        let unit = self.config.work_unit();

        match job {
            Job::Load {
                generation,
                mut job,
                mut map,
            } => match job.step(&mut map, &self.provider, unit) {
                Ok(BuildStatus::Pending) => {
                    self.backoff.reset();
                    self.queue.push_front(Job::Load { generation, job, map });
                    PumpStatus::Progress
                }
                Ok(BuildStatus::Complete) => {
                    self.backoff.reset();
                    self.finish_load(map);
                    PumpStatus::Progress
                }
                Err(e) => match self.retry_delay(e.clone(), "loading revisions") {
                    Some(delay) => {
                        self.queue.push_front(Job::Load { generation, job, map });
                        PumpStatus::Backoff(delay)
                    }
                    None => {
                        map.record_error(LoadError::new(None, format!("load abandoned: {}", e)));
                        self.finish_load(map);
                        PumpStatus::Progress
                    }
                },
            },
            Job::Match { generation, mut job } => match job.step(&self.map, &self.provider, unit) {
                Ok(false) => {
                    self.backoff.reset();
                    self.queue.push_front(Job::Match { generation, job });
                    PumpStatus::Progress
                }
                Ok(true) => {
                    self.backoff.reset();
                    self.finish_match(job);
                    PumpStatus::Progress
                }
                Err(e) => match self.retry_delay(e.clone(), "evaluating filter") {
                    Some(delay) => {
                        self.queue.push_front(Job::Match { generation, job });
                        PumpStatus::Backoff(delay)
                    }
                    None => {
                        // rows not reached yet count as unmatched
                        self.map
                            .record_error(LoadError::new(None, format!("filter evaluation abandoned: {}", e)));
                        self.finish_match(job);
                        PumpStatus::Progress
                    }
                },
            },
            Job::Layout { generation } => {
                if !self.filter.is_empty() && self.matches.is_none() {
                    debug!("Layout {} waits for filter matches", generation);
                    return PumpStatus::Progress;
                }
                self.publish(generation);
                PumpStatus::Progress
            }
        }
    }

    /// Logs a failure and schedules the retry. `None` when the error is not
    /// retryable or the attempts are used up.
    fn retry_delay(&mut self, error: ProviderError, context: &str) -> Option<Duration> {
        let error = EngineError::from(error);
        ErrorReporter::log_error(&error, context);
        if !error.is_retryable() {
            self.backoff.reset();
            return None;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!("Retrying {} in {:?} (attempt {})", context, delay, self.backoff.attempts());
                self.retry_at = Some(Instant::now() + delay);
                Some(delay)
            }
            None => {
                warn!("Giving up {} after {} attempts", context, self.backoff.attempts());
                self.backoff.reset();
                None
            }
        }
    }

    fn finish_load(&mut self, map: GraphMap) {
        let mut lines = BranchLineTable::rebuild(&map, Some(&self.lines), self.config.auto_collapse_depth);
        if let Some(store) = self.store.as_deref() {
            lines.restore(store);
        }
        info!(
            "Load finished: {} rows in {} lines{}",
            map.len(),
            lines.len(),
            if map.is_truncated() { " (truncated)" } else { "" }
        );
        if map.more_available() {
            ErrorReporter::log_error(&EngineError::budget_exceeded(map.loaded_count()), "load");
        }
        if self
            .selection
            .as_ref()
            .is_some_and(|id| map.seq_of(id).is_none())
        {
            self.selection = None;
        }
        self.map = map;
        self.lines = lines;
        self.matches = None;
        self.compiler.invalidate();

        let generation = self.generation;
        if self.filter.is_empty() {
            self.queue.push_back(Job::Layout { generation });
        } else {
            self.queue.push_back(Job::Match {
                generation,
                job: PathMatchJob::new(self.filter.clone()),
            });
        }
    }

    fn finish_match(&mut self, job: PathMatchJob) {
        self.matches = Some(job.into_matches(self.config.min_elided_run));
        let generation = self.generation;
        self.queue.push_front(Job::Layout { generation });
    }

    fn publish(&mut self, generation: u64) {
        let last = self.frame.as_ref().map_or(0, |frame| frame.generation);
        let generation = generation.max(last);
        let frame = Arc::new(
            self.compiler
                .compile(&self.map, &mut self.lines, self.matches.as_ref(), generation),
        );
        info!(
            "Publishing frame {} ({} rows{})",
            generation,
            frame.rows.len(),
            if frame.more_available { ", more available" } else { "" }
        );
        self.frame = Some(Arc::clone(&frame));
        self.renderer.apply_frame(frame);
    }

    /// Pumps until idle, sleeping the thread through back-offs.
    pub fn pump_until_idle(&mut self) {
        loop {
            match self.pump() {
                PumpStatus::Idle => break,
                PumpStatus::Progress => {}
                PumpStatus::Backoff(delay) => std::thread::sleep(delay),
            }
        }
    }
}

/// Drives `controller` to idle on a tokio runtime, yielding between units.
pub async fn run_until_idle<P: RevisionProvider, R: Renderer>(controller: &mut StateController<P, R>) {
    loop {
        match controller.pump() {
            PumpStatus::Idle => break,
            PumpStatus::Progress => tokio::task::yield_now().await,
            PumpStatus::Backoff(delay) => tokio::time::sleep(delay).await,
        }
    }
}
