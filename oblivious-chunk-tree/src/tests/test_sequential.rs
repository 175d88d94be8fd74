use assert_matches::assert_matches;
use proptest::prelude::*;

use super::{FlakySigner, bytes, chunk_of, config, mac, other_mac, record_layout};
use crate::{
    BLOB_VERSION, Ed25519Signer, Engine, Error, SequentialTree, TreeConfig, verify_signature,
};

fn build(len: usize, chunk_size: usize) -> (Vec<u8>, SequentialTree) {
    let content = bytes(len);
    let tree = SequentialTree::build(&content, &mac(), config(chunk_size)).expect("build tree");
    (content, tree)
}

fn assert_sound(tree: &SequentialTree, expected: &[u8]) {
    tree.check_invariants().expect("tree invariants");
    assert_eq!(tree.content(), expected);
    let blob = tree.generate_signature().expect("generate signature");
    assert!(tree.verify_signature(expected, &blob, &mac()));
}

#[test]
fn build_splits_into_chunks_and_verifies() {
    let (content, tree) = build(550, 5);
    assert_eq!(tree.size(), 110);
    assert_eq!(tree.chunk(0).unwrap(), content[..5].to_vec());
    assert_eq!(tree.chunk(109).unwrap(), content[545..].to_vec());
    assert_sound(&tree, &content);
}

#[test]
fn last_chunk_may_be_short() {
    let (content, tree) = build(23, 5);
    assert_eq!(tree.size(), 5);
    assert_eq!(tree.chunk(4).unwrap(), content[20..].to_vec());
    assert_sound(&tree, &content);
}

#[test]
fn empty_tree_signs_as_version_byte() {
    let tree = SequentialTree::build(&[], &mac(), config(4)).unwrap();
    assert_eq!(tree.size(), 0);
    assert_eq!(tree.height(), 0);
    assert_eq!(tree.generate_signature().unwrap(), vec![BLOB_VERSION]);
    assert_sound(&tree, &[]);

    tree.insert(b"ab", 0, &mac()).unwrap();
    assert_eq!(tree.size(), 1);
    assert_sound(&tree, b"ab");
}

#[test]
fn single_chunk_root_is_a_leaf() {
    let (content, tree) = build(3, 8);
    assert_eq!(tree.height(), 0);
    let blob = tree.generate_signature().unwrap();
    let layout = record_layout(&blob);
    assert_eq!(layout.len(), 1);
    assert_eq!(layout[0].2, 0);
    assert_sound(&tree, &content);
}

#[test]
fn zero_chunk_size_is_rejected() {
    assert_matches!(
        SequentialTree::build(b"abc", &mac(), TreeConfig::default().with_chunk_size(0)),
        Err(Error::InvalidConfig(_))
    );
}

#[test]
fn debug_output_reports_shape() {
    let (_, tree) = build(12, 3);
    let dump = format!("{tree:?}");
    assert!(dump.starts_with("SequentialTree"));
    assert!(dump.contains("size: 4"));
    assert!(dump.contains(&format!("height: {}", tree.height())));
}

#[test]
fn height_is_logarithmic() {
    let (_, tree) = build(1000, 1);
    let height = tree.height();
    // 3^6 < 1000 <= 2^10
    assert!((7..=10).contains(&height), "height {height}");
}

#[test]
fn same_seed_builds_same_shape() {
    let content = bytes(300);
    let a = SequentialTree::build(&content, &mac(), config(3)).unwrap();
    let b = SequentialTree::build(&content, &mac(), config(3)).unwrap();
    assert_eq!(a.generate_signature().unwrap(), b.generate_signature().unwrap());
}

#[test]
fn shape_depends_on_coin_flips_not_content() {
    let content = bytes(300);
    let a = SequentialTree::build(&content, &mac(), config(3).with_seed(1)).unwrap();
    let b = SequentialTree::build(&content, &mac(), config(3).with_seed(2)).unwrap();
    assert_eq!(a.leaf_signatures(), b.leaf_signatures());
    assert_ne!(a.generate_signature().unwrap(), b.generate_signature().unwrap());
    assert_sound(&a, &content);
    assert_sound(&b, &content);
}

#[test]
fn insert_at_front_middle_and_end() {
    let chunk_size = 4;
    let (content, tree) = build(40 * chunk_size, chunk_size);
    let mut expected = content;

    for (tag, position) in [(0xa0, 0), (0xa1, 17), (0xa2, 42)] {
        let chunk = chunk_of(tag, chunk_size);
        tree.insert(&chunk, position, &mac()).unwrap();
        let at = position * chunk_size;
        expected.splice(at..at, chunk.iter().copied());
        assert_sound(&tree, &expected);
    }
    assert_eq!(tree.size(), 43);
    assert_eq!(tree.chunk(17).unwrap(), chunk_of(0xa1, chunk_size));
}

#[test]
fn many_inserts_keep_every_invariant() {
    let chunk_size = 2;
    let (content, tree) = build(6, chunk_size);
    let mut expected = content;
    for i in 0..200usize {
        let position = (i * 7) % (tree.size() + 1);
        let chunk = chunk_of(i as u8, chunk_size);
        tree.insert(&chunk, position, &mac()).unwrap();
        let at = position * chunk_size;
        expected.splice(at..at, chunk.iter().copied());
        tree.check_invariants().unwrap();
    }
    assert_sound(&tree, &expected);
}

#[test]
fn short_append_is_allowed_once() {
    let (mut expected, tree) = build(12, 4);
    tree.insert(b"xy", 3, &mac()).unwrap();
    expected.extend_from_slice(b"xy");
    assert_sound(&tree, &expected);

    assert_matches!(
        tree.insert(b"zzzz", 4, &mac()),
        Err(Error::InvalidChunk(_))
    );
}

#[test]
fn insert_rejects_bad_chunks_and_positions() {
    let (content, tree) = build(12, 4);
    assert_matches!(tree.insert(b"ab", 1, &mac()), Err(Error::InvalidChunk(_)));
    assert_matches!(tree.insert(b"", 3, &mac()), Err(Error::InvalidChunk(_)));
    assert_matches!(tree.insert(b"abcde", 0, &mac()), Err(Error::InvalidChunk(_)));
    assert_matches!(
        tree.insert(b"abcd", 4, &mac()),
        Err(Error::IndexOutOfRange { position: 4, size: 3 })
    );
    assert_sound(&tree, &content);
}

#[test]
fn delete_front_middle_and_end() {
    let chunk_size = 3;
    let (content, tree) = build(30 * chunk_size, chunk_size);
    let mut expected = content;
    for position in [0, 14, 27] {
        tree.delete(position, &mac()).unwrap();
        let at = position * chunk_size;
        expected.drain(at..at + chunk_size);
        assert_sound(&tree, &expected);
    }
    assert_eq!(tree.size(), 27);
}

#[test]
fn delete_out_of_range() {
    let (content, tree) = build(9, 3);
    assert_matches!(
        tree.delete(3, &mac()),
        Err(Error::IndexOutOfRange { position: 3, size: 3 })
    );
    assert_sound(&tree, &content);
}

#[test]
fn delete_everything_down_to_empty() {
    let chunk_size = 2;
    let (content, tree) = build(64 * chunk_size, chunk_size);
    let mut expected = content;
    let mut step = 0;
    while tree.size() > 0 {
        let position = (step * 5) % tree.size();
        tree.delete(position, &mac()).unwrap();
        let at = position * chunk_size;
        expected.drain(at..at + chunk_size);
        tree.check_invariants().unwrap();
        step += 1;
    }
    assert_eq!(tree.height(), 0);
    assert_eq!(tree.generate_signature().unwrap(), vec![BLOB_VERSION]);
    assert_sound(&tree, &[]);
}

#[test]
fn insert_then_delete_restores_content() {
    let (content, tree) = build(50, 5);
    let signatures = tree.leaf_signatures();
    tree.insert(&chunk_of(9, 5), 4, &mac()).unwrap();
    assert_eq!(tree.size(), 11);
    tree.delete(4, &mac()).unwrap();
    assert_eq!(tree.size(), 10);
    assert_eq!(tree.leaf_signatures(), signatures);
    assert_sound(&tree, &content);
}

#[test]
fn failed_insert_leaves_tree_unchanged() {
    let (content, tree) = build(200, 4);
    let blob = tree.generate_signature().unwrap();
    let live = tree.elements().live_elements();

    // Leaf signs fine, the first node fails.
    let flaky = FlakySigner::new(mac(), 1);
    assert_matches!(
        tree.insert(&chunk_of(1, 4), 20, &flaky),
        Err(Error::SignatureComputationFailure(_))
    );
    assert_eq!(tree.generate_signature().unwrap(), blob);
    assert_eq!(tree.elements().live_elements(), live);
    assert_sound(&tree, &content);

    // The slots released by the rollback are reused.
    tree.insert(&chunk_of(1, 4), 20, &mac()).unwrap();
    tree.check_invariants().unwrap();
}

#[test]
fn failed_leaf_signature_leaves_tree_unchanged() {
    let (content, tree) = build(20, 4);
    let blob = tree.generate_signature().unwrap();
    assert_matches!(
        tree.insert(&chunk_of(1, 4), 0, &FlakySigner::new(mac(), 0)),
        Err(Error::SignatureComputationFailure(_))
    );
    assert_eq!(tree.generate_signature().unwrap(), blob);
    assert_sound(&tree, &content);
}

#[test]
fn failed_delete_leaves_tree_unchanged() {
    let (content, tree) = build(120, 4);
    let blob = tree.generate_signature().unwrap();
    for budget in 0..3 {
        assert_matches!(
            tree.delete(7, &FlakySigner::new(mac(), budget)),
            Err(Error::SignatureComputationFailure(_))
        );
        assert_eq!(tree.generate_signature().unwrap(), blob);
    }
    assert_sound(&tree, &content);
}

#[test]
fn tampered_content_fails_verification() {
    let (mut content, tree) = build(100, 10);
    let blob = tree.generate_signature().unwrap();
    content[55] ^= 0x01;
    assert!(!tree.verify_signature(&content, &blob, &mac()));
}

#[test]
fn sabotaged_internal_signature_is_detected() {
    let (content, tree) = build(550, 5);
    {
        let mut elements = tree.elements();
        let root = elements.root().unwrap();
        let child = elements.child(root, 0).unwrap();
        let grandchild = elements.child(child, 1).unwrap();
        let mut signature = elements.signature(grandchild).to_vec();
        signature[0] ^= 0xff;
        elements.set_signature(grandchild, signature).unwrap();
    }
    let blob = tree.generate_signature().unwrap();
    assert!(!tree.verify_signature(&content, &blob, &mac()));
}

#[test]
fn six_chunks_with_corrupted_node_signature() {
    let (content, tree) = build(550, 100);
    assert_eq!(tree.size(), 6);
    assert_eq!(tree.chunk(5).unwrap().len(), 50);
    assert_sound(&tree, &content);
    {
        let mut elements = tree.elements();
        let root = elements.root().unwrap();
        let node = elements.child(root, 0).unwrap();
        assert!(!elements.element(node).unwrap().is_leaf());
        let mut signature = elements.signature(node).to_vec();
        signature[31] ^= 0x80;
        elements.set_signature(node, signature).unwrap();
    }
    let blob = tree.generate_signature().unwrap();
    assert!(!tree.verify_signature(&content, &blob, &mac()));
}

#[test]
fn resign_rotates_the_key() {
    let (content, tree) = build(90, 3);
    let before = tree.leaf_signatures();
    tree.resign(&other_mac()).unwrap();
    assert_ne!(tree.leaf_signatures(), before);

    let blob = tree.generate_signature().unwrap();
    assert!(tree.verify_signature(&content, &blob, &other_mac()));
    assert!(!tree.verify_signature(&content, &blob, &mac()));
    tree.check_invariants().unwrap();
}

#[test]
fn ed25519_round_trip() {
    let signer = Ed25519Signer::from_bytes(&[42; 32]);
    let stranger = Ed25519Signer::from_bytes(&[43; 32]);
    let content = bytes(333);
    let tree = SequentialTree::build(&content, &signer, config(16)).unwrap();
    tree.insert(&[7; 16], 3, &signer).unwrap();
    tree.delete(10, &signer).unwrap();

    let expected = tree.content();
    let blob = tree.generate_signature().unwrap();
    assert!(tree.verify_signature(&expected, &blob, &signer.verifier()));
    assert!(!tree.verify_signature(&expected, &blob, &stranger.verifier()));
    assert!(!tree.verify_signature(&content, &blob, &signer.verifier()));
}

#[test]
fn element_model_tracks_neighbors() {
    let (_, tree) = build(40, 1);
    let elements = tree.elements();
    let leaves = elements.leaves().to_vec();
    for pair in leaves.windows(2) {
        assert_eq!(elements.level_neighbor(pair[0]), Some(pair[1]));
        assert_eq!(elements.left_neighbor(pair[1]), Some(pair[0]));
    }
    assert_eq!(elements.left_neighbor(leaves[0]), None);
    assert_eq!(elements.level_neighbor(leaves[39]), None);

    let root = elements.root().unwrap();
    assert!(elements.degree(root) >= 2);
    for &child in elements.children(root) {
        assert_eq!(elements.parent(child), Some(root));
    }
}

#[test]
fn node_refuses_a_fourth_child() {
    let (_, tree) = build(30, 1);
    let mut elements = tree.elements();
    let root = elements.root().unwrap();
    let leaf = elements.leaf(0).unwrap();
    while elements.degree(root) < 3 {
        let extra = elements.child(elements.child(root, 0).unwrap(), 0).unwrap();
        elements.add_child(root, extra).unwrap();
    }
    assert_matches!(
        elements.add_child(root, leaf),
        Err(Error::StructuralInconsistency(_))
    );
}

#[test]
fn broken_structure_is_reported() {
    let (_, tree) = build(30, 1);
    {
        let mut elements = tree.elements();
        let root = elements.root().unwrap();
        let first = elements.child(root, 0).unwrap();
        let leaf = elements.leaf(0).unwrap();
        elements.set_child(root, 0, leaf).unwrap();
        assert_ne!(first, leaf);
    }
    assert_matches!(tree.check_invariants(), Err(Error::StructuralInconsistency(_)));
}

#[test]
fn visualize_lists_every_element() {
    let (_, tree) = build(7, 1);
    let dump = tree.visualize();
    assert_eq!(dump.matches("leaf").count(), 7);
    assert!(dump.starts_with("node/"));
}

fn exercise<E: Engine<crate::Blake3Mac>>(engine: &E, mut expected: Vec<u8>) {
    let chunk_size = engine.chunk_size();
    engine.insert(&chunk_of(0xee, chunk_size), 1, &mac()).unwrap();
    expected.splice(chunk_size..chunk_size, chunk_of(0xee, chunk_size));
    engine.delete(0, &mac()).unwrap();
    expected.drain(..chunk_size);
    let blob = engine.generate_signature().unwrap();
    assert!(engine.verify_signature(&expected, &blob, &mac()));
    assert!(verify_signature(&expected, &blob, &mac(), chunk_size));
    assert_eq!(engine.size(), expected.len() / chunk_size);
}

#[test]
fn sequential_tree_as_engine() {
    let (content, tree) = build(64, 4);
    exercise(&tree, content);
}

#[test]
fn concurrent_worker_as_engine() {
    let content = bytes(64);
    let tree = crate::ConcurrentTree::build(&content, &mac(), config(4)).unwrap();
    exercise(&tree.worker(), content);
}

#[derive(Debug, Clone)]
enum Edit {
    Insert(usize, u8),
    Delete(usize),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), any::<u8>()).prop_map(|(p, t)| Edit::Insert(p, t)),
        any::<usize>().prop_map(Edit::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn edits_match_a_chunk_model(
        initial in 0usize..40,
        seed in any::<u64>(),
        edits in prop::collection::vec(edit(), 1..60),
    ) {
        let chunk_size = 2;
        let content = bytes(initial * chunk_size);
        let tree = SequentialTree::build(
            &content,
            &mac(),
            TreeConfig::default().with_chunk_size(chunk_size).with_seed(seed),
        ).unwrap();
        let mut model: Vec<Vec<u8>> = content.chunks(chunk_size).map(<[u8]>::to_vec).collect();

        for edit in edits {
            match edit {
                Edit::Insert(p, tag) => {
                    let position = p % (model.len() + 1);
                    let chunk = chunk_of(tag, chunk_size);
                    tree.insert(&chunk, position, &mac()).unwrap();
                    model.insert(position, chunk);
                }
                Edit::Delete(p) if !model.is_empty() => {
                    let position = p % model.len();
                    tree.delete(position, &mac()).unwrap();
                    model.remove(position);
                }
                Edit::Delete(p) => {
                    let is_out_of_range = matches!(
                        tree.delete(p, &mac()),
                        Err(Error::IndexOutOfRange { .. })
                    );
                    prop_assert!(is_out_of_range);
                }
            }
            prop_assert!(tree.check_invariants().is_ok());
            prop_assert_eq!(tree.size(), model.len());
        }
        let expected = model.concat();
        prop_assert_eq!(tree.content(), expected.clone());
        let blob = tree.generate_signature().unwrap();
        prop_assert!(tree.verify_signature(&expected, &blob, &mac()));
    }
}
