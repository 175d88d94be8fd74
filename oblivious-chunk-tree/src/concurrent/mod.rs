//! Lock-free concurrent engine.
//!
//! Operations are queued as task descriptors and executed one at a time in
//! queue order. The task at the head of the queue is the current task; any
//! worker may advance it by one stage, so a stalled thread never blocks the
//! others. Each version of the tree is built from immutable nodes and
//! published by swapping the committed version pointer, so readers always see
//! a consistent tree.
//!
//! Replaced versions, statuses and finished tasks are retired through an
//! epoch collector and freed once no helper can still be reading them. Nodes
//! are shared between versions and go away with the last version reaching
//! them.

mod node;
mod stage;
mod task;

use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    ptr,
    sync::{
        Arc,
        atomic::{
            AtomicPtr, AtomicU64,
            Ordering::{AcqRel, Acquire, SeqCst},
        },
    },
};

use arrayvec::ArrayVec;
use rand_chacha::ChaCha20Rng;
use seize::{Collector, Guard, LocalGuard};
use tracing::{debug, trace};

use self::{
    node::{Census, NodeRef, SharedNode, Snapshot},
    task::TaskDescriptor,
};
pub use self::task::{DescriptorStatus, Operation, Stage, TaskOutcome};
use crate::{
    Error, Result, TreeConfig,
    builder::TreeBuilder,
    element::{ElementId, MAX_DEGREE, MIN_DEGREE},
    engine::Engine,
    signer::Signer,
    tree::Tree,
};

/// Randomized 2-3 chunk tree shared by many workers.
pub struct ConcurrentTree<S> {
    config: TreeConfig,
    pub(crate) census: Census,
    collector: Collector,
    /// Latest committed version; owns one strong count.
    committed: AtomicPtr<Snapshot>,
    /// The current task: head of the queue. Every task reachable from here
    /// owns one strong count held by the queue.
    current: AtomicPtr<TaskDescriptor<S>>,
    tail: AtomicPtr<TaskDescriptor<S>>,
    workers: AtomicU64,
    _tasks: PhantomData<Arc<TaskDescriptor<S>>>,
}

impl<S: Signer> ConcurrentTree<S> {
    /// Chunk `bytes`, sign every chunk and build the initial version.
    pub fn build(bytes: &[u8], signer: &S, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = config.rng(0);
        let tree = TreeBuilder::new(signer, &mut rng).build_bytes(bytes, &config)?;

        let census = Census::default();
        let root = match tree.root() {
            Some(root) => Some(import(&tree, &census, root)?),
            None => None,
        };
        let committed = Arc::new(Snapshot {
            root,
            height: tree.height(),
            size: tree.len(),
        });
        let sentinel = Arc::new(TaskDescriptor::new(Operation::Void, DescriptorStatus::void()));
        let sentinel = Arc::into_raw(sentinel).cast_mut();

        debug!(chunks = tree.len(), height = tree.height(), "built concurrent chunk tree");
        Ok(ConcurrentTree {
            config,
            census,
            collector: Collector::new(),
            committed: AtomicPtr::new(Arc::into_raw(committed).cast_mut()),
            current: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            workers: AtomicU64::new(0),
            _tasks: PhantomData,
        })
    }

    /// A new worker with its own random source.
    pub fn worker(&self) -> Worker<'_, S> {
        let ordinal = self.workers.fetch_add(1, SeqCst) + 1;
        Worker {
            tree: self,
            rng: RefCell::new(self.config.rng(ordinal)),
        }
    }

    /// Advance the current task by one stage, or retire it and make the next
    /// queued task current.
    ///
    /// Returns `false` when there is nothing left to do.
    fn help_once(&self, rng: &mut ChaCha20Rng) -> bool {
        let guard = self.collector.enter();
        let current = guard.protect(&self.current, Acquire);
        // SAFETY: the queue always holds at least the current task, and the
        // guard keeps it alive even if another helper retires it meanwhile.
        let task = unsafe { &*current };
        let seen = guard.protect(&task.status, Acquire);
        // SAFETY: statuses are only replaced by compare-and-swap and retired
        // through the collector.
        let status = unsafe { &*seen };

        if status.is_terminal() {
            self.commit(status, &guard);
            let next = task.next();
            if next.is_null() {
                return false;
            }
            // The tail must never point behind the current task.
            let _ = self.tail.compare_exchange(current, next, AcqRel, Acquire);
            if self.current.compare_exchange(current, next, AcqRel, Acquire).is_ok() {
                // SAFETY: neither the head nor the tail reaches `current` any
                // more, and it holds the queue's strong count.
                unsafe { guard.defer_retire(current, |ptr, _| drop(Arc::from_raw(ptr))) };
                trace!(operation = task.operation.name(), "retired finished task");
            }
            return true;
        }

        let proposal = self.advance(&task.operation, status, rng);
        let (stage, depth) = (proposal.stage, proposal.depth);
        let proposal = Box::into_raw(Box::new(proposal));
        match task.status.compare_exchange(seen, proposal, AcqRel, Acquire) {
            Ok(_) => {
                // SAFETY: the descriptor no longer points at `seen`.
                unsafe { guard.defer_retire(seen, |ptr, _| drop(Box::from_raw(ptr))) };
                trace!(operation = task.operation.name(), ?stage, depth, "advanced task");
            }
            Err(_) => {
                // SAFETY: the proposal was never published.
                drop(unsafe { Box::from_raw(proposal) });
                trace!(operation = task.operation.name(), "another worker advanced first");
            }
        }
        true
    }
}

impl<S> ConcurrentTree<S> {
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Append a task to the queue. Nothing runs until a worker helps.
    pub fn submit(&self, operation: Operation<S>) -> TaskHandle<'_, S> {
        let task = Arc::new(TaskDescriptor::new(operation, DescriptorStatus::new_task()));
        let linked = Arc::into_raw(Arc::clone(&task)).cast_mut();
        let guard = self.collector.enter();
        loop {
            let tail = guard.protect(&self.tail, Acquire);
            // SAFETY: the tail never trails the current task, so it is queued.
            let last = unsafe { &*tail };
            let next = last.next();
            if !next.is_null() {
                let _ = self.tail.compare_exchange(tail, next, AcqRel, Acquire);
                continue;
            }
            if last
                .next
                .compare_exchange(ptr::null_mut(), linked, AcqRel, Acquire)
                .is_ok()
            {
                let _ = self.tail.compare_exchange(tail, linked, AcqRel, Acquire);
                trace!(operation = task.operation.name(), "queued task");
                return TaskHandle { tree: self, task };
            }
        }
    }

    /// Publish the version produced by a finished task.
    ///
    /// Idempotent: only succeeds while the task's base is still committed.
    fn commit(&self, status: &DescriptorStatus, guard: &LocalGuard<'_>) {
        let (Some(base), Some(result)) = (&status.base, &status.result) else {
            return;
        };
        if Arc::ptr_eq(base, result) {
            return;
        }
        let fresh = Arc::into_raw(Arc::clone(result)).cast_mut();
        let expected = Arc::as_ptr(base).cast_mut();
        match self.committed.compare_exchange(expected, fresh, AcqRel, Acquire) {
            Ok(previous) => {
                // SAFETY: the committed slot owned this strong count and no
                // longer points at it.
                unsafe { guard.defer_retire(previous, |ptr, _| drop(Arc::from_raw(ptr))) };
                trace!(size = result.size, height = result.height, "committed version");
            }
            // SAFETY: `fresh` was never published.
            Err(_) => drop(unsafe { Arc::from_raw(fresh) }),
        }
    }

    /// The latest committed version.
    fn committed(&self) -> Arc<Snapshot> {
        let guard = self.collector.enter();
        let snapshot = guard.protect(&self.committed, Acquire);
        // SAFETY: the slot owns a strong count, and the guard delays releasing
        // a replaced version until it is dropped.
        unsafe {
            Arc::increment_strong_count(snapshot);
            Arc::from_raw(snapshot)
        }
    }

    /// Number of chunks in the committed version.
    pub fn size(&self) -> usize {
        self.committed().size
    }

    pub fn height(&self) -> usize {
        self.committed().height
    }

    /// Byte stream of the committed version.
    pub fn content(&self) -> Vec<u8> {
        let snapshot = self.committed();
        let mut content = Vec::new();
        let mut stack: Vec<&SharedNode> = snapshot.root.as_deref().into_iter().collect();
        while let Some(node) = stack.pop() {
            match node.chunk() {
                Some(chunk) => content.extend_from_slice(chunk),
                None => stack.extend(node.children().iter().rev().map(|child| &**child)),
            }
        }
        content
    }

    /// Copy of chunk `position` in the committed version.
    pub fn chunk(&self, position: usize) -> Result<Vec<u8>> {
        let snapshot = self.committed();
        if position >= snapshot.size {
            return Err(Error::IndexOutOfRange {
                position,
                size: snapshot.size,
            });
        }
        stage::leaf_at(&snapshot, position)?
            .chunk()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::structural("internal node at leaf depth"))
    }

    /// Nodes alive across every version still reachable, including versions
    /// retired but not yet reclaimed.
    pub fn retained_nodes(&self) -> usize {
        self.census.count()
    }

    /// Check the committed version: degrees, uniform leaf depth, cached leaf
    /// counts and size.
    pub fn check_invariants(&self) -> Result<()> {
        let snapshot = self.committed();
        let Some(root) = &snapshot.root else {
            if snapshot.size != 0 || snapshot.height != 0 {
                return Err(Error::structural("empty version with content"));
            }
            return Ok(());
        };
        let leaves = audit(root, 0, snapshot.height)?;
        if leaves != snapshot.size {
            return Err(Error::structural(format!(
                "version holds {leaves} leaves but records size {}",
                snapshot.size
            )));
        }
        Ok(())
    }

    /// Render the committed version for debugging.
    pub fn visualize(&self) -> String {
        let snapshot = self.committed();
        let mut out = Vec::new();
        match crate::visualize::visualize(&snapshot.view(), &mut out) {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(e) => format!("<unprintable tree: {e}>"),
        }
    }
}

impl<S> Drop for ConcurrentTree<S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out live workers and handles, so no guard
        // can be reading. The committed slot and the queue own one strong
        // count each; retired objects are left to the collector.
        unsafe {
            drop(Arc::from_raw(*self.committed.get_mut()));
            let mut task = *self.current.get_mut();
            while !task.is_null() {
                let next = (*task).next();
                drop(Arc::from_raw(task));
                task = next;
            }
        }
    }
}

impl<S> fmt::Debug for ConcurrentTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.committed();
        f.debug_struct("ConcurrentTree")
            .field("config", &self.config)
            .field("size", &snapshot.size)
            .field("height", &snapshot.height)
            .finish_non_exhaustive()
    }
}

fn audit(node: &SharedNode, depth: usize, height: usize) -> Result<usize> {
    let children = node.children();
    if children.is_empty() {
        if depth != height || node.chunk().is_none() {
            return Err(Error::structural(format!("leaf at depth {depth} of {height}")));
        }
        return Ok(1);
    }
    if !(MIN_DEGREE..=MAX_DEGREE).contains(&children.len()) {
        return Err(Error::structural(format!(
            "node at depth {depth} has degree {}",
            children.len()
        )));
    }
    let mut leaves = 0;
    for child in children {
        leaves += audit(child, depth + 1, height)?;
    }
    if leaves != node.leaf_count {
        return Err(Error::structural(format!(
            "node at depth {depth} caches {} leaves, holds {leaves}",
            node.leaf_count
        )));
    }
    Ok(leaves)
}

/// Copy a built tree into shared nodes, children first.
fn import(tree: &Tree, census: &Census, id: ElementId) -> Result<NodeRef> {
    let element = tree.get(id)?;
    let signature = element.signature().to_vec();
    if let Some(chunk) = element.chunk() {
        return Ok(SharedNode::leaf(census, chunk.to_vec(), signature));
    }
    let mut children = ArrayVec::new();
    for &child in element.children() {
        children
            .try_push(import(tree, census, child)?)
            .map_err(|_| Error::structural("node with more than three children"))?;
    }
    Ok(SharedNode::node(census, children, signature))
}

/// Handle to a submitted task. Keeps the task readable after it leaves the
/// queue.
pub struct TaskHandle<'t, S> {
    tree: &'t ConcurrentTree<S>,
    task: Arc<TaskDescriptor<S>>,
}

impl<S> TaskHandle<'_, S> {
    /// Copy of the task's current status.
    pub fn status(&self) -> DescriptorStatus {
        let guard = self.tree.collector.enter();
        let status = guard.protect(&self.task.status, Acquire);
        // SAFETY: replaced statuses are retired through this tree's collector,
        // which the guard belongs to.
        unsafe { (*status).clone() }
    }
}

impl<S> fmt::Debug for TaskHandle<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle")
            .field(&self.task.operation.name())
            .finish()
    }
}

/// A thread's handle on a [`ConcurrentTree`].
///
/// Holds the worker's private random source, so it is not `Sync`: create one
/// worker per thread.
pub struct Worker<'t, S> {
    tree: &'t ConcurrentTree<S>,
    rng: RefCell<ChaCha20Rng>,
}

impl<'t, S: Signer> Worker<'t, S> {
    pub fn submit(&self, operation: Operation<S>) -> TaskHandle<'t, S> {
        self.tree.submit(operation)
    }

    /// Help the queue until `handle` is done and return its outcome.
    pub fn wait(&self, handle: TaskHandle<'_, S>) -> TaskOutcome {
        loop {
            let status = handle.status();
            if let Some(outcome) = status.outcome() {
                self.tree.commit(&status, &self.tree.collector.enter());
                return outcome.clone();
            }
            self.help();
        }
    }

    /// Perform one helping step. Returns `false` if the queue is idle.
    pub fn help(&self) -> bool {
        self.tree.help_once(&mut self.rng.borrow_mut())
    }

    /// Help until the queue is idle.
    pub fn drain(&self) {
        while self.help() {}
    }

    pub fn generate_signature(&self) -> Result<Vec<u8>> {
        let handle = self.submit(Operation::GenerateSignature);
        self.wait(handle).into_signature()
    }
}

impl<S: Signer + Clone> Worker<'_, S> {
    pub fn insert(&self, value: &[u8], position: usize, signer: &S) -> Result<()> {
        let handle = self.submit(Operation::Insert {
            value: value.to_vec(),
            position,
            signer: signer.clone(),
        });
        self.wait(handle).into_applied()
    }

    pub fn delete(&self, position: usize, signer: &S) -> Result<()> {
        let handle = self.submit(Operation::Delete {
            position,
            signer: signer.clone(),
        });
        self.wait(handle).into_applied()
    }
}

impl<S: Signer + Clone> Engine<S> for Worker<'_, S> {
    fn insert(&self, value: &[u8], position: usize, signer: &S) -> Result<()> {
        Worker::insert(self, value, position, signer)
    }

    fn delete(&self, position: usize, signer: &S) -> Result<()> {
        Worker::delete(self, position, signer)
    }

    fn generate_signature(&self) -> Result<Vec<u8>> {
        Worker::generate_signature(self)
    }

    fn size(&self) -> usize {
        self.tree.size()
    }

    fn chunk_size(&self) -> usize {
        self.tree.chunk_size()
    }
}
