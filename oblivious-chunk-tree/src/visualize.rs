//! Human-readable tree dumps for debugging.

use std::io::{Result, Write};

use crate::signature::SignedView;

/// Bytes kept from each end of an abbreviated signature.
const SIGNATURE_EDGE: usize = 4;
const INDENT: usize = 4;

/// Hex of `signature`, shortened to its first and last bytes when long.
pub fn abbreviate(signature: &[u8]) -> String {
    if signature.len() <= 2 * SIGNATURE_EDGE {
        return hex::encode(signature);
    }
    let (head, rest) = signature.split_at(SIGNATURE_EDGE);
    let tail = &rest[rest.len() - SIGNATURE_EDGE..];
    format!("{}..{}", hex::encode(head), hex::encode(tail))
}

/// Write one line per element in pre-order, each child indented one step
/// deeper than its parent.
pub fn visualize<T: SignedView + ?Sized, W: Write>(view: &T, mut out: W) -> Result<()> {
    match view.root() {
        Some(root) => print_subtree(view, root, 0, &mut out)?,
        None => writeln!(out, "<empty>")?,
    }
    out.flush()
}

fn print_subtree<T: SignedView + ?Sized, W: Write>(
    view: &T,
    id: T::Id,
    depth: usize,
    out: &mut W,
) -> Result<()> {
    let mut children = view.children(id);
    let signature = abbreviate(view.signature(id));
    let pad = depth * INDENT;
    match children.len() {
        0 => writeln!(out, "{:pad$}leaf [sig: {signature}]", ""),
        degree => {
            writeln!(out, "{:pad$}node/{degree} [sig: {signature}]", "")?;
            children.try_for_each(|child| print_subtree(view, child, depth + 1, out))
        }
    }
}
