//! Fake host, UI and dispatcher for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use safekeep_lib::capture::{CapabilityRegistry, Exportable, StateCapture};
use safekeep_lib::guard::{
    ActionDispatcher, ClickEvent, ConfirmationRequest, ConfirmationResponder, UiSurface,
};
use safekeep_lib::store::PersistentStore;
use safekeep_lib::{EventBus, SnapshotStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub score: i64,
    pub moves: u32,
    pub bubbles: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct BoardCell(Mutex<Board>);

impl BoardCell {
    pub fn get(&self) -> Board {
        self.0.lock().unwrap().clone()
    }

    pub fn play(&self, points: i64) {
        let mut board = self.0.lock().unwrap();
        board.score += points;
        board.moves += 1;
        let bubble = (board.moves % 7) as u8;
        board.bubbles.push(bubble);
    }
}

impl Exportable for BoardCell {
    type State = Board;

    fn export_state(&self) -> Board {
        self.get()
    }

    fn import_state(&self, state: Board) -> Result<(), String> {
        *self.0.lock().unwrap() = state;
        Ok(())
    }
}

pub struct Game {
    pub board: Arc<BoardCell>,
    pub registry: Arc<CapabilityRegistry>,
}

impl Game {
    pub fn new() -> Self {
        let board = Arc::new(BoardCell::default());
        let mut registry = CapabilityRegistry::new().with_session_id("integration");
        registry.register("board", board.clone());
        Self {
            board,
            registry: Arc::new(registry),
        }
    }

    pub fn capture(&self) -> StateCapture {
        StateCapture::new(self.registry.clone())
    }

    pub fn open_store(
        &self,
        backend: Arc<dyn PersistentStore>,
        max_save_points: usize,
    ) -> SnapshotStore {
        let settings = safekeep_lib::snapshot_store::SnapshotSettings {
            max_save_points,
            ..Default::default()
        };
        SnapshotStore::open(self.capture(), backend, settings, EventBus::new())
    }
}

#[derive(Default)]
pub struct ScriptedUi {
    shown: Mutex<Vec<(ConfirmationRequest, ConfirmationResponder)>>,
}

impl ScriptedUi {
    pub fn shown(&self) -> usize {
        self.shown.lock().unwrap().len()
    }

    pub fn responder(&self, i: usize) -> ConfirmationResponder {
        self.shown.lock().unwrap()[i].1.clone()
    }
}

impl UiSurface for ScriptedUi {
    fn show_confirmation(&self, request: &ConfirmationRequest, responder: ConfirmationResponder) {
        self.shown.lock().unwrap().push((request.clone(), responder));
    }

    fn hide(&self, _element_id: &str) {}
}

#[derive(Default)]
pub struct Dispatched(Mutex<Vec<String>>);

impl Dispatched {
    pub fn ids(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ActionDispatcher for Dispatched {
    fn dispatch(&self, event: &ClickEvent) {
        self.0.lock().unwrap().push(event.target.id.clone());
    }
}
