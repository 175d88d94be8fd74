//! Stage transitions of a task.
//!
//! Every function here is pure with respect to shared state: it only reads
//! published versions and builds fresh immutable nodes, so any number of
//! helpers may run the same transition at once and at most one result wins.

use std::sync::Arc;

use arrayvec::ArrayVec;
use rand::Rng;
use tracing::debug;

use super::{
    ConcurrentTree,
    node::{NodeRef, SharedNode, Snapshot},
    task::{DescriptorStatus, Operation, PathStep, Stage, TaskOutcome},
};
use crate::{
    Error, Result,
    builder::partition,
    element::{MAX_DEGREE, MIN_DEGREE},
    signature::generate_signature,
    signer::{Signer, sign_leaf, sign_node},
};

impl<S: Signer> ConcurrentTree<S> {
    /// Compute the successor of `status` without publishing it.
    ///
    /// Failures become a `Done` status carrying the error, with the base
    /// version as result so nothing is committed.
    pub(super) fn advance<R: Rng + ?Sized>(
        &self,
        operation: &Operation<S>,
        status: &DescriptorStatus,
        rng: &mut R,
    ) -> DescriptorStatus {
        let base = match &status.base {
            Some(base) => Arc::clone(base),
            None => self.committed(),
        };
        let next = match status.stage {
            Stage::New => self.start(operation, &base),
            Stage::Link => self.propose(operation, status, &base, rng),
            Stage::Open => self.climb(status, &base),
            Stage::Done | Stage::Void => Ok(status.clone()),
        };
        next.unwrap_or_else(|e| {
            debug!(operation = operation.name(), error = %e, "task failed");
            DescriptorStatus::done(Arc::clone(&base), base, TaskOutcome::Failed(e))
        })
    }

    /// `New`: validate, sign the new leaf and splice it into its parent's
    /// child run. Trivial trees and signature generation finish right away.
    fn start(&self, operation: &Operation<S>, base: &Arc<Snapshot>) -> Result<DescriptorStatus> {
        match operation {
            Operation::Insert {
                value,
                position,
                signer,
            } => {
                let position = *position;
                let last_len = match base.size.checked_sub(1) {
                    Some(last) => leaf_at(base, last)?.chunk().map(<[u8]>::len),
                    None => None,
                };
                self.config
                    .check_insert(value, position, base.size, last_len)?;
                let signature = sign_leaf(signer, value)?;
                let leaf = SharedNode::leaf(&self.census, value.clone(), signature);

                let Some(root) = &base.root else {
                    return Ok(finish(base, Snapshot {
                        root: Some(leaf),
                        height: 0,
                        size: 1,
                    }));
                };
                if base.height == 0 {
                    let run = if position == 0 {
                        [leaf, Arc::clone(root)]
                    } else {
                        [Arc::clone(root), leaf]
                    };
                    let node = self.make_node(signer, &run)?;
                    return Ok(finish(base, Snapshot {
                        root: Some(node),
                        height: 1,
                        size: 2,
                    }));
                }

                let path = locate(base, position.min(base.size - 1))?;
                let bottom = step(&path, base.height - 1)?;
                let mut run = bottom.node.children().to_vec();
                let slot = if position < base.size { bottom.slot } else { bottom.slot + 1 };
                run.insert(slot, leaf);
                let depth = base.height - 1;
                Ok(DescriptorStatus::link(Arc::clone(base), path.into(), depth, run))
            }
            Operation::Delete { position, .. } => {
                let position = *position;
                if position >= base.size {
                    return Err(Error::IndexOutOfRange {
                        position,
                        size: base.size,
                    });
                }
                if base.height == 0 {
                    return Ok(finish(base, Snapshot::default()));
                }
                let path = locate(base, position)?;
                let bottom = step(&path, base.height - 1)?;
                let mut run = bottom.node.children().to_vec();
                run.remove(bottom.slot);
                let depth = base.height - 1;
                Ok(DescriptorStatus::link(Arc::clone(base), path.into(), depth, run))
            }
            Operation::GenerateSignature => {
                let blob = generate_signature(&base.view())?;
                let outcome = TaskOutcome::Signature(blob);
                Ok(DescriptorStatus::done(Arc::clone(base), Arc::clone(base), outcome))
            }
            Operation::Void => Ok(DescriptorStatus::done(
                Arc::clone(base),
                Arc::clone(base),
                TaskOutcome::Applied,
            )),
        }
    }

    /// `Link(d) -> Open(d)`: either agree on a single node for the pending
    /// run, or regroup the whole level under the parent.
    ///
    /// At the root the new version is assembled instead.
    fn propose<R: Rng + ?Sized>(
        &self,
        operation: &Operation<S>,
        status: &DescriptorStatus,
        base: &Arc<Snapshot>,
        rng: &mut R,
    ) -> Result<DescriptorStatus> {
        let signer = operation
            .signer()
            .ok_or_else(|| Error::structural("linking a task that carries no signer"))?;
        let run = &status.unassigned_children;
        if status.depth == 0 {
            return self.settle_root(operation, run, base, signer, rng);
        }

        let parent = step(&status.path, status.depth - 1)?;
        if (MIN_DEGREE..=MAX_DEGREE).contains(&run.len()) && rng.gen_bool(0.5) {
            let node = self.make_node(signer, run)?;
            return Ok(DescriptorStatus::open(
                Arc::clone(base),
                Arc::clone(&status.path),
                status.depth,
                Some(node),
                Vec::new(),
            ));
        }

        let mut grandchildren = Vec::new();
        for (slot, sibling) in parent.node.children().iter().enumerate() {
            if slot == parent.slot {
                grandchildren.extend_from_slice(run);
            } else {
                grandchildren.extend_from_slice(sibling.children());
            }
        }
        let regrouped = self.regroup(signer, &grandchildren, rng)?;
        Ok(DescriptorStatus::open(
            Arc::clone(base),
            Arc::clone(&status.path),
            status.depth,
            None,
            regrouped,
        ))
    }

    /// `Open(d) -> Link(d - 1)`: hand the result to the parent level.
    fn climb(&self, status: &DescriptorStatus, base: &Arc<Snapshot>) -> Result<DescriptorStatus> {
        let depth = status
            .depth
            .checked_sub(1)
            .ok_or_else(|| Error::structural("open task above the root"))?;
        let parent = step(&status.path, depth)?;
        let run = match &status.proposed_subtree {
            Some(node) => {
                let mut run = parent.node.children().to_vec();
                let slot = run
                    .get_mut(parent.slot)
                    .ok_or_else(|| Error::structural("path slot past the end of its node"))?;
                *slot = Arc::clone(node);
                run
            }
            None => status.unassigned_children.clone(),
        };
        Ok(DescriptorStatus::link(Arc::clone(base), Arc::clone(&status.path), depth, run))
    }

    /// Build the new root over `run` and produce the resulting version.
    fn settle_root<R: Rng + ?Sized>(
        &self,
        operation: &Operation<S>,
        run: &[NodeRef],
        base: &Arc<Snapshot>,
        signer: &S,
        rng: &mut R,
    ) -> Result<DescriptorStatus> {
        let size = match operation {
            Operation::Insert { .. } => base.size + 1,
            Operation::Delete { .. } => base.size.saturating_sub(1),
            Operation::GenerateSignature | Operation::Void => base.size,
        };
        let mut height = base.height;
        let root = match run {
            [] => return Err(Error::structural("root lost every child")),
            [only] => {
                height -= 1;
                Arc::clone(only)
            }
            _ => {
                let mut level = run.to_vec();
                while level.len() > MAX_DEGREE {
                    level = self.regroup(signer, &level, rng)?;
                    height += 1;
                }
                self.make_node(signer, &level)?
            }
        };
        if height != base.height {
            debug!(from = base.height, to = height, "tree height changed");
        }
        Ok(finish(base, Snapshot {
            root: Some(root),
            height,
            size,
        }))
    }

    /// Split `run` into random groups of 2 or 3 under fresh signed nodes.
    fn regroup<R: Rng + ?Sized>(
        &self,
        signer: &S,
        run: &[NodeRef],
        rng: &mut R,
    ) -> Result<Vec<NodeRef>> {
        let mut nodes = Vec::new();
        let mut start = 0;
        for size in partition(run.len(), rng) {
            nodes.push(self.make_node(signer, &run[start..start + size])?);
            start += size;
        }
        Ok(nodes)
    }

    fn make_node(&self, signer: &S, run: &[NodeRef]) -> Result<NodeRef> {
        let children = ArrayVec::<NodeRef, MAX_DEGREE>::try_from(run).map_err(|_| {
            Error::structural(format!(
                "{} children exceed the maximum degree {MAX_DEGREE}",
                run.len()
            ))
        })?;
        let signature = sign_node(signer, children.iter().map(|child| child.signature()))?;
        Ok(SharedNode::node(&self.census, children, signature))
    }
}

fn finish(base: &Arc<Snapshot>, snapshot: Snapshot) -> DescriptorStatus {
    DescriptorStatus::done(Arc::clone(base), Arc::new(snapshot), TaskOutcome::Applied)
}

/// Descend from the root to leaf `position` by leaf counts.
pub(super) fn locate(snapshot: &Snapshot, position: usize) -> Result<Vec<PathStep>> {
    let mut node = snapshot
        .root
        .clone()
        .ok_or_else(|| Error::structural("descending into an empty tree"))?;
    let mut remaining = position;
    let mut path = Vec::with_capacity(snapshot.height);
    for _ in 0..snapshot.height {
        let mut found = None;
        for (slot, child) in node.children().iter().enumerate() {
            if remaining < child.leaf_count {
                found = Some((slot, Arc::clone(child)));
                break;
            }
            remaining -= child.leaf_count;
        }
        let (slot, child) = found.ok_or(Error::IndexOutOfRange {
            position,
            size: snapshot.size,
        })?;
        path.push(PathStep { node, slot });
        node = child;
    }
    Ok(path)
}

pub(super) fn leaf_at(snapshot: &Snapshot, position: usize) -> Result<NodeRef> {
    let path = locate(snapshot, position)?;
    match path.last() {
        Some(bottom) => bottom
            .node
            .children()
            .get(bottom.slot)
            .cloned()
            .ok_or_else(|| Error::structural("path slot past the end of its node")),
        None => snapshot
            .root
            .clone()
            .ok_or_else(|| Error::structural("descending into an empty tree")),
    }
}

fn step(path: &[PathStep], depth: usize) -> Result<&PathStep> {
    path.get(depth)
        .ok_or_else(|| Error::structural(format!("no path step at depth {depth}")))
}
