use pretty_assertions::assert_eq;
use revgraph::graph::Filter;
use revgraph::models::{BranchTip, BranchTipSet, RevisionId};
use revgraph::provider::MemoryProvider;
use revgraph::state::{
    run_until_idle, EngineConfig, JsonCollapseStore, Renderer, StateController,
};
use revgraph::graph::LayoutFrame;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    frames: Vec<Arc<LayoutFrame>>,
}

impl Renderer for Recorder {
    fn apply_frame(&mut self, frame: Arc<LayoutFrame>) {
        self.frames.push(frame);
    }
}

fn merge_history() -> MemoryProvider {
    let mut provider = MemoryProvider::new();
    provider
        .add("D", &[], 1)
        .add("B", &["D"], 2)
        .add("C", &["D"], 3)
        .add("A", &["B", "C"], 4);
    provider
}

fn chain(length: usize) -> MemoryProvider {
    let mut provider = MemoryProvider::new();
    for index in 0..length {
        let id = format!("c{}", index);
        let parent = format!("c{}", index + 1);
        if index + 1 < length {
            provider.add(&id, &[parent.as_str()], (length - index) as i64);
        } else {
            provider.add(&id, &[], (length - index) as i64);
        }
    }
    provider
}

fn tips(head: &str) -> BranchTipSet {
    BranchTipSet::from_tips([BranchTip::new("main", head)])
}

#[tokio::test]
async fn async_driver_publishes_frames_in_generation_order() {
    let mut controller = StateController::new(merge_history(), Recorder::default(), EngineConfig::default());
    controller.on_tips_changed(tips("A"));
    run_until_idle(&mut controller).await;

    controller.on_filter_changed(Filter::new().with_search("commit C"));
    run_until_idle(&mut controller).await;

    let frames = &controller.renderer().frames;
    assert_eq!(frames.len(), 2);
    assert!(frames.windows(2).all(|pair| pair[0].generation < pair[1].generation));
    assert_eq!(controller.frame().unwrap().generation, frames[1].generation);
    assert!(controller.is_idle());
}

#[tokio::test]
async fn load_more_extends_until_history_ends() {
    let config = EngineConfig {
        max_revisions: 3,
        extend_step: 2,
        ..EngineConfig::default()
    };
    let mut controller = StateController::new(chain(6), Recorder::default(), config);
    controller.on_tips_changed(tips("c0"));
    run_until_idle(&mut controller).await;
    let frame = controller.frame().unwrap();
    assert_eq!(frame.rows.len(), 3);
    assert!(frame.more_available);

    controller.request_more();
    run_until_idle(&mut controller).await;
    let frame = controller.frame().unwrap();
    assert_eq!(frame.rows.len(), 5);
    assert!(frame.more_available);

    controller.request_more();
    run_until_idle(&mut controller).await;
    let frame = controller.frame().unwrap();
    assert_eq!(frame.rows.len(), 6);
    assert!(!frame.more_available);

    // nothing left: no new generation, no new frame
    let generation = controller.generation();
    let published = controller.renderer().frames.len();
    controller.request_more();
    run_until_idle(&mut controller).await;
    assert_eq!(controller.generation(), generation);
    assert_eq!(controller.renderer().frames.len(), published);
}

#[tokio::test]
async fn rapid_filter_changes_coalesce() {
    let mut controller = StateController::new(merge_history(), Recorder::default(), EngineConfig::default());
    controller.on_tips_changed(tips("A"));
    run_until_idle(&mut controller).await;

    controller.on_filter_changed(Filter::new().with_search("commit A"));
    controller.on_filter_changed(Filter::new().with_search("commit B"));
    controller.on_filter_changed(Filter::new().with_search("commit D"));
    run_until_idle(&mut controller).await;

    let frames = &controller.renderer().frames;
    assert_eq!(frames.len(), 2);
    let last = frames.last().unwrap();
    let visible: Vec<(String, bool)> = last
        .rows
        .iter()
        .map(|row| (row.id.to_string(), row.hollow))
        .collect();
    assert!(visible.contains(&("D".to_string(), false)));
    assert!(last.row_by_id(&RevisionId::from("C")).is_none());
}

#[tokio::test]
async fn collapse_flags_survive_a_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("collapse.json");

    {
        let store = JsonCollapseStore::open(&path).unwrap();
        let mut controller = StateController::new(merge_history(), Recorder::default(), EngineConfig::default())
            .with_store(Box::new(store));
        controller.on_tips_changed(tips("A"));
        run_until_idle(&mut controller).await;
        assert!(controller.on_twisty_clicked(0));
        run_until_idle(&mut controller).await;
        assert_eq!(controller.frame().unwrap().rows.len(), 3);
    }

    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("true"));

    let store = JsonCollapseStore::open(&path).unwrap();
    let mut controller = StateController::new(merge_history(), Recorder::default(), EngineConfig::default())
        .with_store(Box::new(store));
    controller.on_tips_changed(tips("A"));
    run_until_idle(&mut controller).await;
    let frame = controller.frame().unwrap();
    assert_eq!(frame.rows.len(), 3);
    assert!(!frame.rows[0].twisty.as_ref().unwrap().expanded);

    controller.expand_all();
    run_until_idle(&mut controller).await;
    assert_eq!(controller.frame().unwrap().rows.len(), 4);
}
