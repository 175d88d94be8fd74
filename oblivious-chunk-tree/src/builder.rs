//! Bottom-up construction of a randomized 2-3 tree.

use rand::Rng;
use tracing::debug;

use crate::{
    Result, TreeConfig,
    element::{Element, ElementId},
    signer::{Signer, sign_leaf, sign_node},
    tree::Tree,
};

/// Flip a candidate degree: 2 or 3 with equal probability.
pub(crate) fn flip_degree<R: Rng + ?Sized>(rng: &mut R) -> usize {
    if rng.gen_bool(0.5) { 3 } else { 2 }
}

/// Split a run of `n` elements into consecutive groups of 2 or 3.
///
/// Group sizes are drawn at random, except that the tail is steered so no
/// group of 1 (or 4) is ever left behind: 4 remaining split 2+2, 3 or 2
/// remaining form the last group. A run of 0 or 1 yields itself.
pub(crate) fn partition<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(n / 2 + 1);
    let mut remaining = n;
    while remaining > 0 {
        let size = match remaining {
            1..=3 => remaining,
            4 => 2,
            _ => flip_degree(rng),
        };
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// Builds a [`Tree`] from an ordered sequence of chunks.
pub struct TreeBuilder<'a, S: ?Sized, R> {
    signer: &'a S,
    rng: &'a mut R,
}

impl<'a, S: Signer + ?Sized, R: Rng> TreeBuilder<'a, S, R> {
    pub fn new(signer: &'a S, rng: &'a mut R) -> Self {
        Self { signer, rng }
    }

    /// Sign every chunk of `bytes` and build the tree over them.
    pub fn build_bytes(self, bytes: &[u8], config: &TreeConfig) -> Result<Tree> {
        let mut leaves = Vec::new();
        for chunk in config.chunks(bytes) {
            let signature = sign_leaf(self.signer, chunk)?;
            leaves.push(Element::leaf(chunk.to_vec(), signature));
        }
        self.build(leaves)
    }

    /// Build a tree over already-signed leaves, in order.
    pub fn build(self, leaves: Vec<Element>) -> Result<Tree> {
        let mut tree = Tree::new();
        let mut level: Vec<ElementId> = leaves.into_iter().map(|leaf| tree.alloc(leaf)).collect();
        link_level(&mut tree, &level)?;
        tree.set_leaves(level.clone());

        let mut height = 0;
        while level.len() > 1 {
            let mut parents = Vec::new();
            let mut start = 0;
            for size in partition(level.len(), &mut *self.rng) {
                let group = &level[start..start + size];
                start += size;
                let node = tree.alloc(Element::node());
                for &child in group {
                    tree.add_child(node, child)?;
                }
                let signature = sign_node(
                    self.signer,
                    group.iter().map(|child| tree.signature(*child)),
                )?;
                tree.set_signature(node, signature)?;
                parents.push(node);
            }
            link_level(&mut tree, &parents)?;
            level = parents;
            height += 1;
        }
        tree.set_root(level.first().copied(), height)?;
        debug!(leaves = tree.len(), height, "built chunk tree");
        Ok(tree)
    }
}

/// Chain `level` left to right through the level-neighbor links.
fn link_level(tree: &mut Tree, level: &[ElementId]) -> Result<()> {
    for (i, &id) in level.iter().enumerate() {
        tree.set_level_neighbor(id, level.get(i + 1).copied())?;
    }
    Ok(())
}
