//! Arena-backed chunk tree with journaled mutation.
//!
//! Elements are addressed by [`ElementId`]. While a transaction is open every
//! element touched is saved before its first change, so a failed mutation can
//! be rolled back to the exact prior state.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use tracing::debug;

use crate::{
    Error, Result,
    element::{Children, Element, ElementId, MAX_DEGREE, MIN_DEGREE},
    signer::{Signer, sign_node},
};

enum IndexOp {
    Inserted(usize),
    Removed(usize, ElementId),
}

/// Undo log of an open transaction.
struct Journal {
    saved: BTreeMap<ElementId, Option<Element>>,
    released: Vec<ElementId>,
    index: Vec<IndexOp>,
    root: Option<ElementId>,
    height: usize,
}

/// A 2-3 tree over signed chunks.
///
/// All leaves sit at depth `height`; `height` is 0 when the root is a leaf or
/// the tree is empty.
pub struct Tree {
    slots: Vec<Option<Element>>,
    free: Vec<ElementId>,
    root: Option<ElementId>,
    height: usize,
    leaves: Vec<ElementId>,
    journal: Option<Journal>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// An empty tree.
    pub fn new() -> Self {
        Tree {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            height: 0,
            leaves: Vec::new(),
            journal: None,
        }
    }

    pub fn root(&self) -> Option<ElementId> {
        self.root
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of leaves (chunks).
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaf holding chunk `position`.
    pub fn leaf(&self, position: usize) -> Option<ElementId> {
        self.leaves.get(position).copied()
    }

    /// The positional index: leaves in chunk order.
    pub fn leaves(&self) -> &[ElementId] {
        &self.leaves
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get(&self, id: ElementId) -> Result<&Element> {
        self.element(id)
            .ok_or_else(|| Error::structural(format!("dangling element {}", id.index())))
    }

    pub(crate) fn get_mut(&mut self, id: ElementId) -> Result<&mut Element> {
        self.touch(id);
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::structural(format!("dangling element {}", id.index())))
    }

    // ── Element model ───────────────────────────────────────────────────

    pub fn degree(&self, id: ElementId) -> usize {
        self.element(id).map_or(0, Element::degree)
    }

    pub fn children(&self, id: ElementId) -> &[ElementId] {
        self.element(id).map_or(&[], Element::children)
    }

    pub fn child(&self, id: ElementId, index: usize) -> Option<ElementId> {
        self.children(id).get(index).copied()
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.element(id).and_then(Element::parent)
    }

    pub fn level_neighbor(&self, id: ElementId) -> Option<ElementId> {
        self.element(id).and_then(Element::level_neighbor)
    }

    pub fn signature(&self, id: ElementId) -> &[u8] {
        self.element(id).map_or(&[], Element::signature)
    }

    pub fn set_parent(&mut self, id: ElementId, parent: Option<ElementId>) -> Result<()> {
        self.get_mut(id)?.parent = parent;
        Ok(())
    }

    pub fn set_level_neighbor(&mut self, id: ElementId, next: Option<ElementId>) -> Result<()> {
        self.get_mut(id)?.level_neighbor = next;
        Ok(())
    }

    pub fn set_signature(&mut self, id: ElementId, signature: Vec<u8>) -> Result<()> {
        self.get_mut(id)?.signature = signature;
        Ok(())
    }

    /// Append `child` to `node`, making `node` its parent.
    ///
    /// Fails if `node` already has three children.
    pub fn add_child(&mut self, node: ElementId, child: ElementId) -> Result<()> {
        self.get_mut(node)?.children_mut()?.push(child)?;
        self.set_parent(child, Some(node))
    }

    /// Detach and return the child at `index`.
    pub fn remove_child(&mut self, node: ElementId, index: usize) -> Result<ElementId> {
        self.get_mut(node)?.children_mut()?.remove(index)
    }

    /// Replace the child at `index`, returning the previous occupant.
    pub fn set_child(
        &mut self,
        node: ElementId,
        index: usize,
        child: ElementId,
    ) -> Result<ElementId> {
        let previous = self.get_mut(node)?.children_mut()?.set(index, child)?;
        self.set_parent(child, Some(node))?;
        Ok(previous)
    }

    /// Replace the whole child run of `node` and re-parent every entry.
    pub(crate) fn replace_children(&mut self, node: ElementId, run: &[ElementId]) -> Result<()> {
        *self.get_mut(node)?.children_mut()? = Children::from_slice(run)?;
        for &child in run {
            self.set_parent(child, Some(node))?;
        }
        Ok(())
    }

    /// The element immediately left of `id` on its level.
    ///
    /// Derived from the parent chain since only rightward links are stored.
    pub fn left_neighbor(&self, id: ElementId) -> Option<ElementId> {
        let parent = self.parent(id)?;
        let position = self.children(parent).iter().position(|c| *c == id)?;
        if position > 0 {
            return self.child(parent, position - 1);
        }
        let uncle = self.left_neighbor(parent)?;
        self.children(uncle).last().copied()
    }

    /// Number of levels below `id`: 0 for a leaf.
    pub(crate) fn level_of(&self, id: ElementId) -> usize {
        let mut level = 0;
        let mut current = id;
        while let Some(&first) = self.children(current).first() {
            current = first;
            level += 1;
        }
        level
    }

    // ── Arena ───────────────────────────────────────────────────────────

    pub(crate) fn alloc(&mut self, element: Element) -> ElementId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                ElementId((self.slots.len() - 1) as u32)
            }
        };
        self.touch(id);
        self.slots[id.index()] = Some(element);
        id
    }

    pub(crate) fn release(&mut self, id: ElementId) {
        self.touch(id);
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = None;
        }
        match &mut self.journal {
            Some(journal) => journal.released.push(id),
            None => self.free.push(id),
        }
    }

    pub(crate) fn set_root(&mut self, root: Option<ElementId>, height: usize) -> Result<()> {
        if let Some(root) = root {
            let element = self.get_mut(root)?;
            element.parent = None;
            element.level_neighbor = None;
        }
        if height != self.height {
            debug!(from = self.height, to = height, "tree height changed");
        }
        self.root = root;
        self.height = height;
        Ok(())
    }

    pub(crate) fn index_insert(&mut self, position: usize, leaf: ElementId) {
        self.leaves.insert(position, leaf);
        if let Some(journal) = &mut self.journal {
            journal.index.push(IndexOp::Inserted(position));
        }
    }

    pub(crate) fn index_remove(&mut self, position: usize) -> ElementId {
        let leaf = self.leaves.remove(position);
        if let Some(journal) = &mut self.journal {
            journal.index.push(IndexOp::Removed(position, leaf));
        }
        leaf
    }

    /// Bulk-load the positional index; used by the builder only.
    pub(crate) fn set_leaves(&mut self, leaves: Vec<ElementId>) {
        self.leaves = leaves;
    }

    fn touch(&mut self, id: ElementId) {
        if let Some(journal) = &mut self.journal {
            journal
                .saved
                .entry(id)
                .or_insert_with(|| self.slots.get(id.index()).cloned().flatten());
        }
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Run `f` atomically: on error every change it made is undone.
    pub(crate) fn transact<T>(&mut self, f: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        self.journal = Some(Journal {
            saved: BTreeMap::new(),
            released: Vec::new(),
            index: Vec::new(),
            root: self.root,
            height: self.height,
        });
        let result = f(self);
        let Some(journal) = self.journal.take() else {
            return Err(Error::structural("transaction journal vanished"));
        };
        match result {
            Ok(value) => {
                self.free.extend(journal.released);
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, touched = journal.saved.len(), "rolling back tree mutation");
                self.rollback(journal);
                Err(e)
            }
        }
    }

    fn rollback(&mut self, journal: Journal) {
        for (id, prior) in journal.saved {
            if prior.is_none() {
                self.free.push(id);
            }
            self.slots[id.index()] = prior;
        }
        for op in journal.index.into_iter().rev() {
            match op {
                IndexOp::Inserted(position) => {
                    self.leaves.remove(position);
                }
                IndexOp::Removed(position, leaf) => self.leaves.insert(position, leaf),
            }
        }
        self.root = journal.root;
        self.height = journal.height;
    }

    // ── Signatures ──────────────────────────────────────────────────────

    /// Re-sign every node in `dirty` and all of their ancestors, children
    /// before parents.
    pub(crate) fn resign<S: Signer + ?Sized>(
        &mut self,
        dirty: &BTreeSet<ElementId>,
        signer: &S,
    ) -> Result<usize> {
        let mut pending = BTreeSet::new();
        for &id in dirty {
            let mut current = Some(id);
            while let Some(id) = current {
                if self.element(id).is_none() || !pending.insert(id) {
                    break;
                }
                current = self.parent(id);
            }
        }
        let mut ordered: Vec<(usize, ElementId)> = pending
            .into_iter()
            .filter(|id| self.element(*id).is_some_and(|e| !e.is_leaf()))
            .map(|id| (self.level_of(id), id))
            .collect();
        ordered.sort_unstable();
        for &(_, id) in &ordered {
            let signature = sign_node(
                signer,
                self.children(id).iter().map(|child| self.signature(*child)),
            )?;
            self.set_signature(id, signature)?;
        }
        Ok(ordered.len())
    }

    /// Chunk bytes of every leaf, in order.
    pub fn content(&self) -> Vec<u8> {
        self.leaves
            .iter()
            .filter_map(|leaf| self.element(*leaf).and_then(Element::chunk))
            .flatten()
            .copied()
            .collect()
    }

    // ── Audit ───────────────────────────────────────────────────────────

    /// Check every structural invariant of the tree.
    ///
    /// Degrees are 2 or 3 (the root may have 2 or 3, or be a leaf), every leaf
    /// sits at depth `height`, parent links mirror child runs, each level's
    /// neighbor list visits that level left to right, and the positional index
    /// lists the leaves in order.
    pub fn check_invariants(&self) -> Result<()> {
        let Some(root) = self.root else {
            if !self.leaves.is_empty() {
                return Err(Error::structural("empty tree with indexed leaves"));
            }
            return Ok(());
        };
        if self.parent(root).is_some() {
            return Err(Error::structural("root has a parent"));
        }
        let mut level = vec![root];
        for depth in 0..=self.height {
            for (left, right) in level.iter().copied().tuple_windows() {
                if self.level_neighbor(left) != Some(right) {
                    return Err(Error::structural(format!(
                        "broken level-neighbor link at depth {depth}"
                    )));
                }
            }
            if let Some(&last) = level.last() {
                if self.level_neighbor(last).is_some() {
                    return Err(Error::structural(format!(
                        "last element at depth {depth} has a neighbor"
                    )));
                }
            }
            if depth == self.height {
                if level.iter().any(|id| self.element(*id).is_none_or(|e| !e.is_leaf())) {
                    return Err(Error::structural("internal node at leaf depth"));
                }
                if level != self.leaves {
                    return Err(Error::structural("positional index out of order"));
                }
                break;
            }
            let mut next = Vec::new();
            for &id in &level {
                let element = self.get(id)?;
                if element.is_leaf() {
                    return Err(Error::structural(format!("leaf above depth {}", self.height)));
                }
                let degree = element.degree();
                if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
                    return Err(Error::structural(format!(
                        "node {} has degree {degree}",
                        id.index()
                    )));
                }
                for &child in element.children() {
                    if self.parent(child) != Some(id) {
                        return Err(Error::structural(format!(
                            "child {} does not point back to parent {}",
                            child.index(),
                            id.index()
                        )));
                    }
                    next.push(child);
                }
            }
            level = next;
        }
        Ok(())
    }

    /// Arena slots currently holding an element.
    pub fn live_elements(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn leaf_chunk(&self, position: usize) -> Option<&[u8]> {
        self.leaf(position)
            .and_then(|leaf| self.element(leaf))
            .and_then(Element::chunk)
    }
}
