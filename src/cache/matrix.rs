//! Cache entries: one per (layer, expert, matrix).

use crate::io::AlignedBuf;
use crate::task::Dependent;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Role of a matrix inside an expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    Up = 0,
    Gate = 1,
    Down = 2,
}

impl MatrixKind {
    pub const ALL: [MatrixKind; 3] = [MatrixKind::Up, MatrixKind::Gate, MatrixKind::Down];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    NotPresent,
    Loading,
    Present,
}

/// Mutable part of a [`Matrix`], guarded by its mutex.
///
/// `data` is set exactly while the entry is linked in the LRU, i.e. while the
/// status is `Loading` or `Present`.
pub struct MatrixState {
    pub(super) status: DataStatus,
    pub(super) data: Option<Arc<AlignedBuf>>,
    pub(super) pending: Vec<Arc<dyn Dependent>>,
    pub(super) n_pins: usize,
}

impl MatrixState {
    fn new() -> Self {
        MatrixState {
            status: DataStatus::NotPresent,
            data: None,
            pending: Vec::new(),
            n_pins: 0,
        }
    }

    pub fn status(&self) -> DataStatus {
        self.status
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn n_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn n_pins(&self) -> usize {
        self.n_pins
    }

    /// Hold `task` back until this matrix finishes loading.
    pub fn add_pending(&mut self, task: Arc<dyn Dependent>) {
        assert!(
            self.status != DataStatus::Present,
            "pending task attached to a resident matrix",
        );
        task.hold();
        self.pending.push(task);
    }

    /// Keep the entry resident until `count` matching `unpin` calls.
    pub fn pin(&mut self, count: usize) {
        self.n_pins += count;
    }
}

pub struct Matrix {
    pub layer_id: usize,
    pub expert_id: usize,
    pub matrix_id: usize,
    pub file_offset: u64,
    pub(super) index: usize,
    pub(super) state: Mutex<MatrixState>,
}

impl Matrix {
    pub(super) fn new(
        layer_id: usize,
        expert_id: usize,
        matrix_id: usize,
        file_offset: u64,
        index: usize,
    ) -> Self {
        Matrix {
            layer_id,
            expert_id,
            matrix_id,
            file_offset,
            index,
            state: Mutex::new(MatrixState::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MatrixState> {
        self.state.lock()
    }

    pub fn status(&self) -> DataStatus {
        self.state.lock().status
    }

    /// Buffer of a resident matrix. Panics if the data is not present.
    pub fn data(&self) -> Arc<AlignedBuf> {
        let state = self.state.lock();
        match (&state.data, state.status) {
            (Some(buf), DataStatus::Present) => Arc::clone(buf),
            (_, status) => panic!(
                "matrix ({}, {}, {}) read while {status:?}",
                self.layer_id, self.expert_id, self.matrix_id,
            ),
        }
    }

    pub fn unpin(&self) {
        let mut state = self.state.lock();
        assert!(state.n_pins > 0, "unpin without pin");
        state.n_pins -= 1;
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("layer_id", &self.layer_id)
            .field("expert_id", &self.expert_id)
            .field("matrix_id", &self.matrix_id)
            .field("file_offset", &self.file_offset)
            .finish()
    }
}
