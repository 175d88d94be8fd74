//! Tree elements: the tagged {Node, Leaf} variant stored in the tree arena.

use arrayvec::ArrayVec;

use crate::{Error, Result};

/// Maximum number of children of a node.
pub const MAX_DEGREE: usize = 3;

/// Minimum number of children of a settled non-root node.
pub const MIN_DEGREE: usize = 2;

/// Index of an element in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(pub(crate) u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Ordered child sequence of at most [`MAX_DEGREE`] entries.
///
/// The length is the node's degree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Children(ArrayVec<ElementId, MAX_DEGREE>);

impl Children {
    pub fn from_slice(ids: &[ElementId]) -> Result<Self> {
        let ids = ArrayVec::try_from(ids).map_err(|_| {
            Error::structural(format!(
                "{} children exceed the maximum degree {MAX_DEGREE}",
                ids.len()
            ))
        })?;
        Ok(Children(ids))
    }

    pub fn push(&mut self, child: ElementId) -> Result<()> {
        self.0
            .try_push(child)
            .map_err(|_| Error::structural("node already has 3 children"))
    }

    pub fn remove(&mut self, index: usize) -> Result<ElementId> {
        if index >= self.0.len() {
            return Err(Error::structural(format!(
                "no child at index {index} (degree {})",
                self.0.len()
            )));
        }
        Ok(self.0.remove(index))
    }

    pub fn set(&mut self, index: usize, child: ElementId) -> Result<ElementId> {
        match self.0.get_mut(index) {
            Some(slot) => Ok(std::mem::replace(slot, child)),
            None => Err(Error::structural(format!("no child at index {index}"))),
        }
    }

    pub fn get(&self, index: usize) -> Option<ElementId> {
        self.0.get(index).copied()
    }

    pub fn position(&self, child: ElementId) -> Option<usize> {
        self.0.iter().position(|c| *c == child)
    }

    pub fn as_slice(&self) -> &[ElementId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<ElementId> {
        self.0.first().copied()
    }

    pub fn last(&self) -> Option<ElementId> {
        self.0.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Node(Children),
    /// Terminal element holding one chunk of the stream.
    Leaf(Vec<u8>),
}

/// One node or leaf of the tree.
///
/// `parent` and `level_neighbor` are plain arena indices and never imply
/// ownership; a node owns its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub(crate) kind: ElementKind,
    pub(crate) parent: Option<ElementId>,
    pub(crate) level_neighbor: Option<ElementId>,
    pub(crate) signature: Vec<u8>,
}

impl Element {
    pub fn leaf(chunk: Vec<u8>, signature: Vec<u8>) -> Self {
        Element {
            kind: ElementKind::Leaf(chunk),
            parent: None,
            level_neighbor: None,
            signature,
        }
    }

    pub fn node() -> Self {
        Element {
            kind: ElementKind::Node(Children::default()),
            parent: None,
            level_neighbor: None,
            signature: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ElementKind::Leaf(_))
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    pub fn level_neighbor(&self) -> Option<ElementId> {
        self.level_neighbor
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Number of children; 0 for a leaf.
    pub fn degree(&self) -> usize {
        match &self.kind {
            ElementKind::Node(children) => children.len(),
            ElementKind::Leaf(_) => 0,
        }
    }

    /// Children in order; empty for a leaf.
    pub fn children(&self) -> &[ElementId] {
        match &self.kind {
            ElementKind::Node(children) => children.as_slice(),
            ElementKind::Leaf(_) => &[],
        }
    }

    pub fn chunk(&self) -> Option<&[u8]> {
        match &self.kind {
            ElementKind::Leaf(chunk) => Some(chunk),
            ElementKind::Node(_) => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Result<&mut Children> {
        match &mut self.kind {
            ElementKind::Node(children) => Ok(children),
            ElementKind::Leaf(_) => Err(Error::structural("a leaf has no children")),
        }
    }
}
