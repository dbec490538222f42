//! Fixtures shared by unit tests
//!
//! Only compiled in test builds. `GameHost` is a small host with two
//! capabilities whose imports can be made to fail on demand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::capture::{CapabilityRegistry, Exportable};
use crate::error::StoreError;
use crate::guard::{
    ActionDispatcher, ClickEvent, ConfirmationRequest, ConfirmationResponder, UiSurface,
};
use crate::store::{MemoryStore, PersistentStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub score: u64,
    pub hp: u32,
    pub level: u32,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            score: 0,
            hp: 100,
            level: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub volume: u8,
    pub theme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: 5,
            theme: "light".to_string(),
        }
    }
}

/// Mutable cell exposed as a capability
#[derive(Debug, Default)]
pub struct Cell<T> {
    value: Mutex<T>,
    fail: AtomicBool,
}

impl<T: Clone> Cell<T> {
    pub fn get(&self) -> T {
        self.value.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.value.lock().unwrap());
    }

    pub fn fail_imports(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Cell<Player> {
    pub fn set_score(&self, score: u64) {
        self.update(|p| p.score = score);
    }

    pub fn set_hp(&self, hp: u32) {
        self.update(|p| p.hp = hp);
    }
}

impl Cell<Settings> {
    pub fn set_volume(&self, volume: u8) {
        self.update(|s| s.volume = volume);
    }
}

impl<T> Exportable for Cell<T>
where
    T: Clone + Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    type State = T;

    fn export_state(&self) -> T {
        self.value.lock().unwrap().clone()
    }

    fn import_state(&self, state: T) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("import refused".to_string());
        }
        *self.value.lock().unwrap() = state;
        Ok(())
    }
}

pub struct GameHost {
    pub player: Arc<Cell<Player>>,
    pub settings: Arc<Cell<Settings>>,
}

impl GameHost {
    pub fn new() -> Self {
        Self {
            player: Arc::new(Cell::default()),
            settings: Arc::new(Cell::default()),
        }
    }

    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new().with_session_id("session-test");
        registry
            .register("player", self.player.clone())
            .register("settings", self.settings.clone());
        Arc::new(registry)
    }
}

/// Memory store whose writes can be made to fail
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing_writes: AtomicUsize,
    full_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_writes: AtomicUsize::new(0),
            full_writes: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` writes with an I/O error
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Report the next `n` writes as capacity failures
    pub fn full_for_next_writes(&self, n: usize) {
        self.full_writes.store(n, Ordering::SeqCst);
    }
}

impl PersistentStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let full = self.full_writes.load(Ordering::SeqCst);
        if full > 0 {
            self.full_writes.store(full - 1, Ordering::SeqCst);
            return Err(StoreError::CapacityExceeded {
                key: key.to_string(),
                needed: value.len() as u64,
                available: 0,
            });
        }
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
}

/// UI surface that keeps every request and responder it was handed
#[derive(Default)]
pub struct RecordingUi {
    shown: Mutex<Vec<(ConfirmationRequest, ConfirmationResponder)>>,
    hidden: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn shown(&self) -> usize {
        self.shown.lock().unwrap().len()
    }

    pub fn responder(&self, i: usize) -> ConfirmationResponder {
        self.shown.lock().unwrap()[i].1.clone()
    }

    pub fn request(&self, i: usize) -> ConfirmationRequest {
        self.shown.lock().unwrap()[i].0.clone()
    }

    pub fn hidden(&self) -> Vec<String> {
        self.hidden.lock().unwrap().clone()
    }
}

impl UiSurface for RecordingUi {
    fn show_confirmation(&self, request: &ConfirmationRequest, responder: ConfirmationResponder) {
        self.shown.lock().unwrap().push((request.clone(), responder));
    }

    fn hide(&self, element_id: &str) {
        self.hidden.lock().unwrap().push(element_id.to_string());
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl ActionDispatcher for RecordingDispatcher {
    fn dispatch(&self, event: &ClickEvent) {
        self.dispatched.lock().unwrap().push(event.target.id.clone());
    }
}
