//! Task descriptors and their immutable status records.
//!
//! A descriptor's `status` points at its current boxed [`DescriptorStatus`].
//! Helpers never edit a status in place: they compute the successor
//! privately and try to swing the pointer with a single compare-and-swap.
//! The loser frees its proposal at once; the replaced status is retired
//! through the tree's collector.

use std::{
    ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, Ordering::Acquire},
    },
};

use super::node::{NodeRef, Snapshot};
use crate::{Error, Result};

/// Operation carried by a task.
pub enum Operation<S> {
    Insert {
        value: Vec<u8>,
        position: usize,
        signer: S,
    },
    Delete {
        position: usize,
        signer: S,
    },
    GenerateSignature,
    /// Placeholder occupying the queue head before any real task.
    Void,
}

impl<S> Operation<S> {
    pub(crate) fn signer(&self) -> Option<&S> {
        match self {
            Operation::Insert { signer, .. } | Operation::Delete { signer, .. } => Some(signer),
            Operation::GenerateSignature | Operation::Void => None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Delete { .. } => "delete",
            Operation::GenerateSignature => "generate_signature",
            Operation::Void => "void",
        }
    }
}

/// Progress of a task.
///
/// Mutations go `New -> Link -> (Open -> Link)* -> Done`, climbing one level
/// per `Open -> Link` step. Signature generation goes `New -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    /// A child run is waiting to be placed under the node at `depth`.
    Link,
    /// The level at `depth` has been regrouped and awaits its parent.
    Open,
    Done,
    Void,
}

/// Result of a finished task, observed identically by every helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Applied,
    Signature(Vec<u8>),
    Failed(Error),
}

impl TaskOutcome {
    pub(crate) fn into_applied(self) -> Result<()> {
        match self {
            TaskOutcome::Applied => Ok(()),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Signature(_) => Err(Error::structural("mutation produced a signature")),
        }
    }

    pub(crate) fn into_signature(self) -> Result<Vec<u8>> {
        match self {
            TaskOutcome::Signature(blob) => Ok(blob),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Applied => Err(Error::structural("signature task produced no blob")),
        }
    }
}

/// Step along the descent from the root to a leaf: the node and the index of
/// the child taken.
#[derive(Debug, Clone)]
pub(crate) struct PathStep {
    pub(crate) node: NodeRef,
    pub(crate) slot: usize,
}

/// Immutable snapshot of a task's progress.
#[derive(Debug, Clone)]
pub struct DescriptorStatus {
    pub(crate) stage: Stage,
    /// Version the task started from.
    pub(crate) base: Option<Arc<Snapshot>>,
    pub(crate) path: Arc<[PathStep]>,
    pub(crate) depth: usize,
    /// Child run for the node at `depth` (Link), or the regrouped run for its
    /// parent (Open without a proposed subtree).
    pub(crate) unassigned_children: Vec<NodeRef>,
    pub(crate) proposed_subtree: Option<NodeRef>,
    /// Version published once the task is done.
    pub(crate) result: Option<Arc<Snapshot>>,
    pub(crate) outcome: Option<TaskOutcome>,
}

impl DescriptorStatus {
    fn bare(stage: Stage) -> Self {
        DescriptorStatus {
            stage,
            base: None,
            path: Arc::from(Vec::new()),
            depth: 0,
            unassigned_children: Vec::new(),
            proposed_subtree: None,
            result: None,
            outcome: None,
        }
    }

    pub(crate) fn void() -> Self {
        Self::bare(Stage::Void)
    }

    pub(crate) fn new_task() -> Self {
        Self::bare(Stage::New)
    }

    pub(crate) fn link(
        base: Arc<Snapshot>,
        path: Arc<[PathStep]>,
        depth: usize,
        run: Vec<NodeRef>,
    ) -> Self {
        DescriptorStatus {
            base: Some(base),
            path,
            depth,
            unassigned_children: run,
            ..Self::bare(Stage::Link)
        }
    }

    pub(crate) fn open(
        base: Arc<Snapshot>,
        path: Arc<[PathStep]>,
        depth: usize,
        proposed: Option<NodeRef>,
        regrouped: Vec<NodeRef>,
    ) -> Self {
        DescriptorStatus {
            base: Some(base),
            path,
            depth,
            unassigned_children: regrouped,
            proposed_subtree: proposed,
            ..Self::bare(Stage::Open)
        }
    }

    pub(crate) fn done(base: Arc<Snapshot>, result: Arc<Snapshot>, outcome: TaskOutcome) -> Self {
        DescriptorStatus {
            base: Some(base),
            result: Some(result),
            outcome: Some(outcome),
            ..Self::bare(Stage::Done)
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Done | Stage::Void)
    }
}

/// A queued operation.
pub(crate) struct TaskDescriptor<S> {
    pub(crate) operation: Operation<S>,
    /// Current status, owned by the descriptor.
    pub(crate) status: AtomicPtr<DescriptorStatus>,
    /// Next task in the queue, or null.
    pub(crate) next: AtomicPtr<TaskDescriptor<S>>,
}

impl<S> TaskDescriptor<S> {
    pub(crate) fn new(operation: Operation<S>, status: DescriptorStatus) -> Self {
        TaskDescriptor {
            operation,
            status: AtomicPtr::new(Box::into_raw(Box::new(status))),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn next(&self) -> *mut TaskDescriptor<S> {
        self.next.load(Acquire)
    }
}

impl<S> Drop for TaskDescriptor<S> {
    fn drop(&mut self) {
        // SAFETY: the status pointer always comes from `Box::into_raw` and
        // replaced statuses are retired separately, so this one is owned here.
        unsafe { drop(Box::from_raw(*self.status.get_mut())) }
    }
}
