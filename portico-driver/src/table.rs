//! In-flight operation storage.
//!
//! Every queued operation gets a slot holding its descriptor, its I/O context
//! (the overlapped record and owned cleanup handles) and backend scratch. The
//! slot box never moves while the operation is in flight, so the overlapped
//! record handed to the kernel stays put. Identities carry a reuse generation;
//! a stale identity simply fails to resolve.

use std::{
    collections::VecDeque,
    io,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use slab::Slab;

use crate::{
    iocp::{IoContext, Scratch, Staged},
    op::{Op, OpKind},
    Id,
};

/// Where an operation is in its lifecycle.
///
/// `Queued -> InFlight -> Finished` is a total order per slot; the slot is
/// released when its finish record drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Queued,
    InFlight,
    Finished,
}

pub(crate) struct OpRuntime {
    pub ctx: IoContext,
    pub op: Op,
    pub scratch: Scratch,
    pub staged: Staged,
    pub user_data: usize,
    pub state: Lifecycle,
    /// Partner of a linked pair, if any.
    pub companion: Option<Id>,
}

impl OpRuntime {
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

pub(crate) struct FinishRecord {
    pub id: Id,
    pub error: Option<io::Error>,
}

/// Shared tail of the table: finish records produced by worker threads and by
/// the driver itself, drained on the driver thread.
pub(crate) type FinishedList = Arc<Mutex<Vec<FinishRecord>>>;

pub(crate) struct OpTable {
    slots: Slab<Box<OpRuntime>>,
    generations: Vec<u32>,
    queued: VecDeque<Id>,
    finished: FinishedList,
    live: usize,
}

impl OpTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            queued: VecDeque::new(),
            finished: Arc::new(Mutex::new(Vec::new())),
            live: 0,
        }
    }

    pub fn insert(&mut self, op: Op, user_data: usize) -> Id {
        let slot = self.slots.insert(Box::new(OpRuntime {
            ctx: IoContext::new(),
            op,
            scratch: Scratch::None,
            staged: Staged::None,
            user_data,
            state: Lifecycle::Queued,
            companion: None,
        }));
        if slot >= self.generations.len() {
            self.generations.resize(slot + 1, 0);
        }
        let id = Id::new(slot, self.generations[slot]);
        self.slots[slot].ctx.set_id(id);
        self.queued.push_back(id);
        self.live += 1;
        id
    }

    /// Bind two freshly inserted requests as a linked pair.
    pub fn link_pair(&mut self, first: Id, second: Id) {
        self.lookup(first).expect("linked slot just inserted").companion = Some(second);
        self.lookup(second).expect("linked slot just inserted").companion = Some(first);
    }

    pub fn take_queued(&mut self) -> Option<Id> {
        self.queued.pop_front()
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn lookup(&mut self, id: Id) -> Option<&mut OpRuntime> {
        // Compare through `Id::new` so the generation is masked the same way
        // it was when the identity was handed out.
        match self.generations.get(id.slot()) {
            Some(&gen) if Id::new(id.slot(), gen) == id => {
                self.slots.get_mut(id.slot()).map(Box::as_mut)
            }
            _ => None,
        }
    }

    /// Raw pointer to a live slot's runtime.
    ///
    /// The box behind the pointer is stable until [`release`](Self::release);
    /// the driver uses this to hand a blocking operation to a worker thread
    /// while the slot stays in the table.
    pub fn runtime_ptr(&mut self, id: Id) -> Option<NonNull<OpRuntime>> {
        self.lookup(id).map(NonNull::from)
    }

    /// Transition a live slot to `Finished`. Returns `false` when the slot is
    /// gone or already finished, in which case the caller must drop its
    /// completion.
    pub fn mark_finished(&mut self, id: Id) -> bool {
        match self.lookup(id) {
            Some(run) if run.state != Lifecycle::Finished => {
                run.state = Lifecycle::Finished;
                true
            }
            _ => false,
        }
    }

    pub fn finished_handle(&self) -> FinishedList {
        self.finished.clone()
    }

    pub fn push_record(&self, id: Id, error: Option<io::Error>) {
        self.finished.lock().unwrap().push(FinishRecord { id, error });
    }

    pub fn take_finished(&self) -> Vec<FinishRecord> {
        std::mem::take(&mut *self.finished.lock().unwrap())
    }

    /// Remove a slot and hand its runtime back, bumping the generation so the
    /// identity goes stale.
    pub fn release(&mut self, id: Id) -> Option<Box<OpRuntime>> {
        match self.generations.get(id.slot()) {
            Some(&gen) if Id::new(id.slot(), gen) == id => {}
            _ => return None,
        }
        if !self.slots.contains(id.slot()) {
            return None;
        }
        let run = self.slots.remove(id.slot());
        self.generations[id.slot()] = self.generations[id.slot()].wrapping_add(1);
        self.live -= 1;
        Some(run)
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn live_ids(&self) -> Vec<Id> {
        self.slots
            .iter()
            .map(|(slot, _)| Id::new(slot, self.generations[slot]))
            .collect()
    }

    /// Teardown escape hatch: leak the runtimes of operations the kernel may
    /// still touch. Leaking is preferable to freeing memory an in-flight
    /// overlapped operation could still write.
    pub fn abandon_remaining(&mut self) -> usize {
        let mut abandoned = 0;
        let slots = std::mem::take(&mut self.slots);
        for (_, run) in slots {
            std::mem::forget(run);
            abandoned += 1;
        }
        self.live = 0;
        abandoned
    }
}
