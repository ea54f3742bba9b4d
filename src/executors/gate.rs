// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Process-wide concurrency gate
//!
//! A single counting semaphore bounds simultaneous backend calls across
//! the whole driver. Head-node limits on file handles and child
//! processes make unbounded fan-out unsafe even when a scheduler could
//! accept more submissions.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A lazily-initialised semaphore cell. The process-wide gate is one
/// static instance of this; tests work against their own cells.
pub struct GateCell {
    cell: Mutex<Option<Arc<Semaphore>>>,
}

impl GateCell {
    /// An uninitialised cell
    pub const fn new() -> Self {
        Self {
            cell: Mutex::new(None),
        }
    }

    /// Set the permit count. The first initialisation wins; later calls
    /// are ignored so the limit stays stable once chosen.
    pub fn initialize(&self, permits: usize) {
        let mut cell = self.cell.lock().expect("concurrency gate lock poisoned");
        if cell.is_none() {
            *cell = Some(Arc::new(Semaphore::new(permits.max(1))));
        }
    }

    /// Acquire a permit, lazily initialising with a single permit if
    /// never configured. The permit releases on drop, covering every
    /// exit path.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut cell = self.cell.lock().expect("concurrency gate lock poisoned");
            cell.get_or_insert_with(|| Arc::new(Semaphore::new(1))).clone()
        };

        semaphore
            .acquire_owned()
            .await
            .expect("concurrency gate semaphore closed")
    }

    /// Permits currently available, if initialised
    pub fn available(&self) -> Option<usize> {
        let cell = self.cell.lock().expect("concurrency gate lock poisoned");
        cell.as_ref().map(|s| s.available_permits())
    }

    /// Drop the configured semaphore so the next use reinitialises.
    /// Intended for tests; the production gate is initialised exactly
    /// once per process. Permits already handed out stay valid against
    /// the old semaphore.
    pub fn reset(&self) {
        let mut cell = self.cell.lock().expect("concurrency gate lock poisoned");
        *cell = None;
    }
}

impl Default for GateCell {
    fn default() -> Self {
        Self::new()
    }
}

static GATE: GateCell = GateCell::new();

/// The global backend-call gate
pub struct ConcurrencyGate;

impl ConcurrencyGate {
    /// Initialise the global gate from the run's concurrency limit
    pub fn initialize(permits: usize) {
        GATE.initialize(permits);
    }

    /// Acquire a permit from the global gate
    pub async fn acquire() -> OwnedSemaphorePermit {
        GATE.acquire().await
    }

    /// Permits currently available on the global gate
    pub fn available() -> Option<usize> {
        GATE.available()
    }

    /// Reinitialise the global gate. Test-only: production code never
    /// resets the limit once chosen.
    #[cfg(test)]
    pub fn reset() {
        GATE.reset();
    }
}
