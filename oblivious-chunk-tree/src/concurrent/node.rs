use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering::Relaxed},
};

use arrayvec::ArrayVec;

use crate::{element::MAX_DEGREE, signature::SignedView};

/// Shared reference to an immutable node.
pub(crate) type NodeRef = Arc<SharedNode>;

/// Number of nodes alive in one tree, across every version still reachable.
#[derive(Debug, Clone, Default)]
pub(crate) struct Census(Arc<AtomicUsize>);

impl Census {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Relaxed)
    }

    fn enroll(&self) -> Census {
        self.0.fetch_add(1, Relaxed);
        self.clone()
    }
}

#[derive(Debug)]
pub(crate) enum Shape {
    Leaf(Vec<u8>),
    Node(ArrayVec<NodeRef, MAX_DEGREE>),
}

/// A node of a published version. Never modified once built: a change
/// produces new nodes along the edited path and shares the rest. A node is
/// freed with the last version that reaches it.
#[derive(Debug)]
pub(crate) struct SharedNode {
    pub(crate) shape: Shape,
    pub(crate) signature: Vec<u8>,
    /// Leaves below this node; 1 for a leaf. Drives positional descent.
    pub(crate) leaf_count: usize,
    census: Census,
}

impl SharedNode {
    pub(crate) fn leaf(census: &Census, chunk: Vec<u8>, signature: Vec<u8>) -> NodeRef {
        Arc::new(SharedNode {
            shape: Shape::Leaf(chunk),
            signature,
            leaf_count: 1,
            census: census.enroll(),
        })
    }

    pub(crate) fn node(
        census: &Census,
        children: ArrayVec<NodeRef, MAX_DEGREE>,
        signature: Vec<u8>,
    ) -> NodeRef {
        let leaf_count = children.iter().map(|child| child.leaf_count).sum();
        Arc::new(SharedNode {
            shape: Shape::Node(children),
            signature,
            leaf_count,
            census: census.enroll(),
        })
    }

    pub(crate) fn children(&self) -> &[NodeRef] {
        match &self.shape {
            Shape::Node(children) => children,
            Shape::Leaf(_) => &[],
        }
    }

    pub(crate) fn chunk(&self) -> Option<&[u8]> {
        match &self.shape {
            Shape::Leaf(chunk) => Some(chunk),
            Shape::Node(_) => None,
        }
    }

    pub(crate) fn signature(&self) -> &[u8] {
        &self.signature
    }
}

impl Drop for SharedNode {
    fn drop(&mut self) {
        self.census.0.fetch_sub(1, Relaxed);
    }
}

/// Root of one version of the tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub(crate) root: Option<NodeRef>,
    pub(crate) height: usize,
    pub(crate) size: usize,
}

impl Snapshot {
    pub(crate) fn view(&self) -> SnapshotView<'_> {
        SnapshotView {
            root: self.root.as_deref(),
        }
    }
}

/// Read-only view of one version, borrowed from its snapshot.
pub(crate) struct SnapshotView<'a> {
    root: Option<&'a SharedNode>,
}

impl<'a> SignedView for SnapshotView<'a> {
    type Id = &'a SharedNode;

    fn root(&self) -> Option<&'a SharedNode> {
        self.root
    }

    fn signature(&self, id: &'a SharedNode) -> &[u8] {
        id.signature()
    }

    fn children(
        &self,
        id: &'a SharedNode,
    ) -> impl DoubleEndedIterator<Item = &'a SharedNode> + ExactSizeIterator {
        id.children().iter().map(|child| &**child)
    }
}
