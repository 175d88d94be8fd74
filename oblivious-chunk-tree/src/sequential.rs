//! Single-writer engine.
//!
//! Insertion and deletion splice one leaf into the bottom level and then
//! repair the degree invariant upward, regrouping each level with fresh coin
//! flips so the shape never reveals the edit history. Every mutation runs in
//! a [`Tree`] transaction: if signing fails midway the tree is left exactly
//! as it was.

use std::{collections::BTreeSet, fmt};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace};

use crate::{
    Error, Result, TreeConfig,
    builder::{TreeBuilder, flip_degree, partition},
    element::{Element, ElementId, MAX_DEGREE, MIN_DEGREE},
    engine::Engine,
    signature::{SignedView, generate_signature},
    signer::{Signer, Verifier, sign_leaf},
    tree::Tree,
};

struct Inner {
    tree: Tree,
    rng: ChaCha20Rng,
}

/// Randomized 2-3 chunk tree owned by one writer at a time.
pub struct SequentialTree {
    config: TreeConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for SequentialTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SequentialTree")
            .field("config", &self.config)
            .field("size", &inner.tree.len())
            .field("height", &inner.tree.height())
            .finish_non_exhaustive()
    }
}

impl SequentialTree {
    /// Chunk `bytes`, sign every chunk and build the tree over them.
    pub fn build<S: Signer + ?Sized>(bytes: &[u8], signer: &S, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = config.rng(0);
        let tree = TreeBuilder::new(signer, &mut rng).build_bytes(bytes, &config)?;
        Ok(SequentialTree {
            config,
            inner: Mutex::new(Inner { tree, rng }),
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Insert `value` as a new chunk before `position`, or append it when
    /// `position` equals the size.
    pub fn insert<S: Signer + ?Sized>(
        &self,
        value: &[u8],
        position: usize,
        signer: &S,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { tree, rng } = &mut *inner;
        let last_len = tree
            .len()
            .checked_sub(1)
            .and_then(|last| tree.leaf_chunk(last))
            .map(<[u8]>::len);
        self.config.check_insert(value, position, tree.len(), last_len)?;
        let signature = sign_leaf(signer, value)?;
        let resigned = tree.transact(|tree| {
            let mut dirty = BTreeSet::new();
            let leaf = Element::leaf(value.to_vec(), signature);
            splice_leaf(tree, leaf, position, rng, &mut dirty)?;
            tree.resign(&dirty, signer)
        })?;
        trace!(position, resigned, size = tree.len(), "inserted chunk");
        Ok(())
    }

    /// Remove the chunk at `position`.
    pub fn delete<S: Signer + ?Sized>(&self, position: usize, signer: &S) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { tree, rng } = &mut *inner;
        if position >= tree.len() {
            return Err(Error::IndexOutOfRange {
                position,
                size: tree.len(),
            });
        }
        let resigned = tree.transact(|tree| {
            let mut dirty = BTreeSet::new();
            unsplice_leaf(tree, position, rng, &mut dirty)?;
            tree.resign(&dirty, signer)
        })?;
        trace!(position, resigned, size = tree.len(), "deleted chunk");
        Ok(())
    }

    /// Serialize the current tree into a signature blob.
    pub fn generate_signature(&self) -> Result<Vec<u8>> {
        generate_signature(&self.inner.lock().tree)
    }

    /// Verify `blob` against `original` using this tree's chunk size.
    pub fn verify_signature<V: Verifier + ?Sized>(
        &self,
        original: &[u8],
        blob: &[u8],
        verifier: &V,
    ) -> bool {
        crate::signature::verify_signature(original, blob, verifier, self.config.chunk_size)
    }

    /// Number of chunks.
    pub fn size(&self) -> usize {
        self.inner.lock().tree.len()
    }

    pub fn height(&self) -> usize {
        self.inner.lock().tree.height()
    }

    /// The byte stream currently held, chunks concatenated in order.
    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().tree.content()
    }

    /// Copy of chunk `position`.
    pub fn chunk(&self, position: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .tree
            .leaf_chunk(position)
            .map(<[u8]>::to_vec)
            .ok_or(Error::IndexOutOfRange {
                position,
                size: inner.tree.len(),
            })
    }

    /// Leaf signatures in chunk order.
    pub fn leaf_signatures(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .tree
            .leaves()
            .iter()
            .map(|leaf| inner.tree.signature(*leaf).to_vec())
            .collect()
    }

    /// Recompute every signature with `signer`, leaves first.
    ///
    /// Used to rotate keys. All-or-nothing like every other mutation.
    pub fn resign<S: Signer + ?Sized>(&self, signer: &S) -> Result<()> {
        let mut inner = self.inner.lock();
        let resigned = inner.tree.transact(|tree| {
            let mut dirty = BTreeSet::new();
            for leaf in tree.leaves().to_vec() {
                let chunk = tree.get(leaf)?.chunk().unwrap_or_default();
                let signature = sign_leaf(signer, chunk)?;
                tree.set_signature(leaf, signature)?;
                dirty.extend(tree.parent(leaf));
            }
            tree.resign(&dirty, signer)
        })?;
        debug!(resigned, "re-signed tree");
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.inner.lock().tree.check_invariants()
    }

    /// Direct access to the element model.
    ///
    /// Changes made through the guard bypass rebalancing and re-signing.
    pub fn elements(&self) -> MappedMutexGuard<'_, Tree> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.tree)
    }

    /// Render the tree for debugging.
    pub fn visualize(&self) -> String {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        match crate::visualize::visualize(&inner.tree, &mut out) {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(e) => format!("<unprintable tree: {e}>"),
        }
    }
}

impl<S: Signer + ?Sized> Engine<S> for SequentialTree {
    fn insert(&self, value: &[u8], position: usize, signer: &S) -> Result<()> {
        SequentialTree::insert(self, value, position, signer)
    }

    fn delete(&self, position: usize, signer: &S) -> Result<()> {
        SequentialTree::delete(self, position, signer)
    }

    fn generate_signature(&self) -> Result<Vec<u8>> {
        SequentialTree::generate_signature(self)
    }

    fn size(&self) -> usize {
        SequentialTree::size(self)
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }
}

impl SignedView for Tree {
    type Id = ElementId;

    fn root(&self) -> Option<ElementId> {
        Tree::root(self)
    }

    fn signature(&self, id: ElementId) -> &[u8] {
        Tree::signature(self, id)
    }

    fn children(
        &self,
        id: ElementId,
    ) -> impl DoubleEndedIterator<Item = ElementId> + ExactSizeIterator {
        Tree::children(self, id).iter().copied()
    }
}

// ── Insertion ───────────────────────────────────────────────────────────

/// Put `leaf` at `position` and restore the degree invariant.
///
/// Nodes whose signature must be recomputed are collected in `dirty`.
fn splice_leaf<R: Rng + ?Sized>(
    tree: &mut Tree,
    leaf: Element,
    position: usize,
    rng: &mut R,
    dirty: &mut BTreeSet<ElementId>,
) -> Result<()> {
    let size = tree.len();
    let successor = tree.leaf(position);
    let leaf = tree.alloc(leaf);
    if let Some(previous) = position.checked_sub(1).and_then(|p| tree.leaf(p)) {
        tree.set_level_neighbor(previous, Some(leaf))?;
    }
    tree.set_level_neighbor(leaf, successor)?;

    let Some(root) = tree.root() else {
        tree.index_insert(0, leaf);
        return tree.set_root(Some(leaf), 0);
    };
    if tree.height() == 0 {
        let node = tree.alloc(Element::node());
        let run = if position == 0 { [leaf, root] } else { [root, leaf] };
        tree.replace_children(node, &run)?;
        tree.index_insert(position, leaf);
        dirty.insert(node);
        return tree.set_root(Some(node), 1);
    }

    let anchor = tree
        .leaf(position.min(size - 1))
        .ok_or_else(|| Error::structural("positional index shorter than size"))?;
    let parent = tree
        .parent(anchor)
        .ok_or_else(|| Error::structural("leaf below the root has no parent"))?;
    let mut run = tree.children(parent).to_vec();
    let slot = position_in(tree, parent, anchor)?;
    run.insert(if position < size { slot } else { slot + 1 }, leaf);
    tree.index_insert(position, leaf);
    overflow(tree, parent, run, rng, dirty)
}

/// Give `node` the child run `run`, pushing any surplus rightward along the
/// level and creating new nodes where it cannot be absorbed, then repeat one
/// level up until a level settles.
fn overflow<R: Rng + ?Sized>(
    tree: &mut Tree,
    mut node: ElementId,
    mut run: Vec<ElementId>,
    rng: &mut R,
    dirty: &mut BTreeSet<ElementId>,
) -> Result<()> {
    loop {
        dirty.insert(node);
        if tree.parent(node).is_none() {
            return regroup_root(tree, node, run, rng, dirty);
        }

        let keep = run.len().min(flip_degree(rng));
        let mut excess = run.split_off(keep);
        tree.replace_children(node, &run)?;

        let mut current = node;
        let mut created = Vec::new();
        while !excess.is_empty() {
            let candidate = flip_degree(rng);
            match tree.level_neighbor(current) {
                None if excess.len() == 1 => {
                    let mut merged = tree.children(current).to_vec();
                    merged.append(&mut excess);
                    let sizes = partition(merged.len(), rng);
                    tree.replace_children(current, &merged[..sizes[0]])?;
                    created = spawn_nodes(tree, current, &merged[sizes[0]..], &sizes[1..])?;
                }
                None => {
                    let sizes = partition(excess.len(), rng);
                    created = spawn_nodes(tree, current, &excess, &sizes)?;
                    excess.clear();
                }
                Some(_) if excess.len() == candidate || excess.len() > MAX_DEGREE => {
                    let sizes = partition(excess.len(), rng);
                    created = spawn_nodes(tree, current, &excess, &sizes)?;
                    excess.clear();
                }
                Some(neighbor) => {
                    let mut merged = std::mem::take(&mut excess);
                    merged.extend_from_slice(tree.children(neighbor));
                    let keep = merged.len().min(flip_degree(rng));
                    excess = merged.split_off(keep);
                    tree.replace_children(neighbor, &merged)?;
                    dirty.insert(neighbor);
                    current = neighbor;
                }
            }
        }

        if created.is_empty() {
            return Ok(());
        }
        dirty.extend(created.iter().copied());
        let parent = tree
            .parent(current)
            .ok_or_else(|| Error::structural("non-root node without a parent"))?;
        let slot = position_in(tree, parent, current)?;
        let mut upper = tree.children(parent).to_vec();
        upper.splice(slot + 1..slot + 1, created);
        node = parent;
        run = upper;
    }
}

/// Settle the root's child run, growing the tree by one level if it holds
/// more than three entries.
fn regroup_root<R: Rng + ?Sized>(
    tree: &mut Tree,
    root: ElementId,
    run: Vec<ElementId>,
    rng: &mut R,
    dirty: &mut BTreeSet<ElementId>,
) -> Result<()> {
    if run.len() <= MAX_DEGREE {
        return tree.replace_children(root, &run);
    }
    let sizes = partition(run.len(), rng);
    tree.replace_children(root, &run[..sizes[0]])?;
    let mut siblings = vec![root];
    siblings.extend(spawn_nodes(tree, root, &run[sizes[0]..], &sizes[1..])?);
    dirty.extend(siblings.iter().copied());

    let new_root = tree.alloc(Element::node());
    tree.replace_children(new_root, &siblings)?;
    dirty.insert(new_root);
    let height = tree.height() + 1;
    tree.set_root(Some(new_root), height)
}

/// Create one node per group of `run` (sizes in `sizes`) and link them into
/// the level right after `after`.
fn spawn_nodes(
    tree: &mut Tree,
    after: ElementId,
    run: &[ElementId],
    sizes: &[usize],
) -> Result<Vec<ElementId>> {
    let next = tree.level_neighbor(after);
    let mut created = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for &size in sizes {
        let node = tree.alloc(Element::node());
        tree.replace_children(node, &run[start..start + size])?;
        start += size;
        created.push(node);
    }
    let mut previous = after;
    for &node in &created {
        tree.set_level_neighbor(previous, Some(node))?;
        previous = node;
    }
    tree.set_level_neighbor(previous, next)?;
    Ok(created)
}

// ── Deletion ────────────────────────────────────────────────────────────

/// Remove the leaf at `position` and restore the degree invariant.
fn unsplice_leaf<R: Rng + ?Sized>(
    tree: &mut Tree,
    position: usize,
    rng: &mut R,
    dirty: &mut BTreeSet<ElementId>,
) -> Result<()> {
    let leaf = tree
        .leaf(position)
        .ok_or(Error::IndexOutOfRange {
            position,
            size: tree.len(),
        })?;
    let Some(parent) = tree.parent(leaf) else {
        tree.index_remove(position);
        tree.release(leaf);
        return tree.set_root(None, 0);
    };
    if let Some(previous) = position.checked_sub(1).and_then(|p| tree.leaf(p)) {
        tree.set_level_neighbor(previous, tree.level_neighbor(leaf))?;
    }
    let slot = position_in(tree, parent, leaf)?;
    tree.remove_child(parent, slot)?;
    tree.index_remove(position);
    tree.release(leaf);
    deficit(tree, parent, rng, dirty)
}

/// Repair `node` after it lost a child: borrow from a degree-3 neighbor or
/// merge with a degree-2 one, then repeat at the parent that lost a child.
fn deficit<R: Rng + ?Sized>(
    tree: &mut Tree,
    mut node: ElementId,
    rng: &mut R,
    dirty: &mut BTreeSet<ElementId>,
) -> Result<()> {
    loop {
        dirty.insert(node);
        if tree.parent(node).is_none() {
            if tree.degree(node) == 1 {
                let child = tree
                    .child(node, 0)
                    .ok_or_else(|| Error::structural("root lost its only child"))?;
                tree.release(node);
                dirty.remove(&node);
                let height = tree.height().saturating_sub(1);
                tree.set_root(Some(child), height)?;
            }
            return Ok(());
        }
        if tree.degree(node) >= MIN_DEGREE {
            return Ok(());
        }

        let emptied = match tree.level_neighbor(node) {
            Some(right) if tree.degree(right) > MIN_DEGREE => {
                let moved = tree.remove_child(right, 0)?;
                tree.add_child(node, moved)?;
                dirty.insert(right);
                None
            }
            Some(right) => {
                let mut merged = tree.children(node).to_vec();
                merged.extend_from_slice(tree.children(right));
                if rng.gen_bool(0.5) {
                    tree.replace_children(node, &merged)?;
                    Some(right)
                } else {
                    tree.replace_children(right, &merged)?;
                    dirty.insert(right);
                    Some(node)
                }
            }
            None => {
                let left = tree
                    .left_neighbor(node)
                    .ok_or_else(|| Error::structural("lone node below the root"))?;
                let mut merged = tree.children(left).to_vec();
                if merged.len() > MIN_DEGREE {
                    let moved = merged.pop().ok_or_else(|| Error::structural("empty node"))?;
                    tree.remove_child(left, merged.len())?;
                    let mut run = vec![moved];
                    run.extend_from_slice(tree.children(node));
                    tree.replace_children(node, &run)?;
                    dirty.insert(left);
                    None
                } else {
                    merged.extend_from_slice(tree.children(node));
                    if rng.gen_bool(0.5) {
                        tree.replace_children(left, &merged)?;
                        dirty.insert(left);
                        Some(node)
                    } else {
                        tree.replace_children(node, &merged)?;
                        Some(left)
                    }
                }
            }
        };

        let Some(emptied) = emptied else {
            return Ok(());
        };
        node = detach(tree, emptied)?;
        dirty.remove(&emptied);
    }
}

/// Unlink a node whose children were merged away from its level and its
/// parent, free it, and return the parent.
fn detach(tree: &mut Tree, node: ElementId) -> Result<ElementId> {
    let parent = tree
        .parent(node)
        .ok_or_else(|| Error::structural("merged node has no parent"))?;
    if let Some(left) = tree.left_neighbor(node) {
        tree.set_level_neighbor(left, tree.level_neighbor(node))?;
    }
    let slot = position_in(tree, parent, node)?;
    tree.remove_child(parent, slot)?;
    tree.release(node);
    Ok(parent)
}

fn position_in(tree: &Tree, parent: ElementId, child: ElementId) -> Result<usize> {
    tree.children(parent)
        .iter()
        .position(|c| *c == child)
        .ok_or_else(|| {
            Error::structural(format!(
                "element {} missing from its parent {}",
                child.index(),
                parent.index()
            ))
        })
}
