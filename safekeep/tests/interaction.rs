//! Undo/redo, click screening and lifecycle wiring driven through the public
//! API

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{Dispatched, Game, ScriptedUi};
use safekeep_lib::clock::ManualClock;
use safekeep_lib::guard::{ClickKind, GuardConfig};
use safekeep_lib::history::HistoryConfig;
use safekeep_lib::{
    Action, ActionHistory, ClickDecision, ClickEvent, EventBus, FileStore, KeyChord,
    LifecycleEvent, PreventionGuard, RecoveryConfig, RecoveryEvent, RecoveryOrchestrator,
    SaveType, TargetDescriptor,
};
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_millis(150);

#[tokio::test(start_paused = true)]
async fn test_new_action_after_undo_truncates_redo_branch() {
    let game = Game::new();
    let history = ActionHistory::new(game.capture(), HistoryConfig::default(), EventBus::new());

    for points in [10, 20, 30] {
        history.record(Action::new("pop")).unwrap();
        game.board.play(points);
        tokio::time::sleep(SETTLE).await;
    }
    assert_eq!(game.board.get().score, 60);

    assert!(history.undo().unwrap().is_applied());
    assert!(history.undo().unwrap().is_applied());
    assert_eq!(game.board.get().score, 10);
    assert!(history.can_redo());

    history.record(Action::new("score")).unwrap();
    game.board.play(5);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(history.len(), 2);
    assert!(!history.can_redo());
    let types: Vec<String> = history
        .records()
        .into_iter()
        .map(|r| r.action_type)
        .collect();
    assert_eq!(types, vec!["pop", "score"]);

    // Undo of the new branch goes back to the first action's after-state
    history.undo().unwrap();
    assert_eq!(game.board.get().score, 10);
    history.redo().unwrap();
    assert_eq!(game.board.get().score, 15);
}

#[tokio::test(start_paused = true)]
async fn test_shortcuts_drive_history() {
    let game = Game::new();
    let history = ActionHistory::new(game.capture(), HistoryConfig::default(), EventBus::new());

    history.record(Action::new("pop")).unwrap();
    game.board.play(3);
    tokio::time::sleep(SETTLE).await;

    assert!(history.handle_shortcut(&KeyChord::ctrl("z")).unwrap().unwrap().is_applied());
    assert_eq!(game.board.get().score, 0);
    assert!(history
        .handle_shortcut(&KeyChord::ctrl_shift("z"))
        .unwrap()
        .unwrap()
        .is_applied());
    assert_eq!(game.board.get().score, 3);
    assert!(history.handle_shortcut(&KeyChord::ctrl("q")).is_none());
}

fn guard() -> (PreventionGuard, ManualClock, Arc<ScriptedUi>, Arc<Dispatched>) {
    let clock = ManualClock::new();
    let ui = Arc::new(ScriptedUi::default());
    let dispatched = Arc::new(Dispatched::default());
    let guard = PreventionGuard::with_clock(
        GuardConfig::default(),
        ui.clone(),
        dispatched.clone(),
        EventBus::new(),
        Arc::new(clock.clone()),
    );
    (guard, clock, ui, dispatched)
}

#[test]
fn test_double_click_counter() {
    let (guard, clock, _, _) = guard();
    let button = ClickEvent::on(TargetDescriptor::new("pop-bubble"));

    assert_eq!(guard.handle_click(&button), ClickDecision::Allow);
    clock.advance(Duration::from_millis(200));
    assert_eq!(
        guard.handle_click(&button),
        ClickDecision::Blocked(ClickKind::Double)
    );
    assert_eq!(guard.statistics().prevented_double_clicks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_target_gets_one_confirmation() {
    let (guard, clock, ui, dispatched) = guard();
    let reset = ClickEvent::on(TargetDescriptor::new("new-game").with_text("New Game"));

    assert_eq!(
        guard.handle_click(&reset),
        ClickDecision::ConfirmationRequested
    );
    clock.advance(Duration::from_millis(400));
    assert_eq!(
        guard.handle_click(&reset),
        ClickDecision::ConfirmationPending
    );
    assert_eq!(ui.shown(), 1);
    assert_eq!(guard.pending_confirmations(), 1);

    assert!(ui.responder(0).confirm());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(dispatched.ids(), vec!["new-game"]);
    assert_eq!(guard.pending_confirmations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_orchestrator_over_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let game = Game::new();
    let mut config = RecoveryConfig::default();
    config.autosave.max_save_points = 20;
    config.storage.dir = Some(temp_dir.path().to_path_buf());

    let orchestrator = Arc::new(RecoveryOrchestrator::new(
        game.registry.clone(),
        Arc::new(FileStore::new(&config.storage_dir())),
        Arc::new(ScriptedUi::default()),
        Arc::new(Dispatched::default()),
        &config,
    ));
    let mut events = orchestrator.subscribe();
    let lifecycle = orchestrator.attach_lifecycle().unwrap();

    orchestrator.start();
    lifecycle.send(LifecycleEvent::Start).unwrap();
    game.board.play(10);
    lifecycle
        .send(LifecycleEvent::Action(Action::new("pop")))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;

    lifecycle
        .send(LifecycleEvent::CriticalAction(Action::new("reset")))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    orchestrator.stop();

    let mut points = orchestrator.snapshots().list_save_points();
    points.sort_by_key(|p| p.save_index);
    let types: Vec<SaveType> = points.iter().map(|p| p.save_type).collect();
    assert_eq!(
        types,
        vec![
            SaveType::Initial,
            SaveType::GameStart,
            SaveType::Periodic,
            SaveType::BeforeCritical,
            SaveType::Final,
        ]
    );
    assert_eq!(orchestrator.history().len(), 2);

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RecoveryEvent::SaveCompleted { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 5);

    // A fresh process sees the same points on disk
    let reopened = game.open_store(Arc::new(FileStore::new(temp_dir.path())), 20);
    assert_eq!(reopened.save_point_count(), 5);
}
