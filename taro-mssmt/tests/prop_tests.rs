//! Property tests for the MS-SMT: proofs verify after arbitrary edit
//! sequences, and the compacted tree tracks the full tree exactly.

use proptest::collection::vec;
use proptest::prelude::*;

use taro_mssmt::{
    empty_tree_root, CompactedTree, FullTree, Leaf, MemoryStore, Tree,
};

#[derive(Debug, Clone)]
enum Edit {
    Insert { key: [u8; 32], value: Vec<u8>, sum: u64 },
    Delete { key: [u8; 32] },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    // Keys are drawn from a small byte alphabet so edits frequently touch
    // the same keys and neighboring paths.
    let key = (0u8..6).prop_map(|b| {
        let mut key = [b; 32];
        key[31] = b.rotate_left(3);
        key
    });
    prop_oneof![
        (key.clone(), vec(any::<u8>(), 1..16), 0u64..1_000_000).prop_map(
            |(key, value, sum)| Edit::Insert { key, value, sum }
        ),
        key.prop_map(|key| Edit::Delete { key }),
    ]
}

proptest! {
    #[test]
    fn proofs_verify_after_any_edit_sequence(edits in vec(edit_strategy(), 1..40)) {
        let mut tree = FullTree::new(MemoryStore::new());
        let mut touched = std::collections::BTreeSet::new();

        for edit in &edits {
            match edit {
                Edit::Insert { key, value, sum } => {
                    tree.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                    touched.insert(*key);
                }
                Edit::Delete { key } => {
                    tree.delete(key).unwrap();
                    touched.insert(*key);
                }
            }
        }

        let root = tree.root().unwrap();
        for key in &touched {
            let leaf = tree.get(key).unwrap();
            let proof = tree.merkle_proof(key).unwrap();
            prop_assert!(proof.verify(key, &leaf, &root));
        }
    }

    #[test]
    fn compacted_tree_tracks_full_tree(edits in vec(edit_strategy(), 1..40)) {
        let mut full = FullTree::new(MemoryStore::new());
        let mut compact = CompactedTree::new(MemoryStore::new());

        for edit in &edits {
            match edit {
                Edit::Insert { key, value, sum } => {
                    full.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                    compact.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                }
                Edit::Delete { key } => {
                    full.delete(key).unwrap();
                    compact.delete(key).unwrap();
                }
            }
            prop_assert_eq!(full.root().unwrap(), compact.root().unwrap());
        }
    }

    #[test]
    fn subtree_roots_agree_between_flavors(
        edits in vec(edit_strategy(), 1..30),
        prefix_byte in any::<u8>(),
        bit_len in 0usize..=24,
    ) {
        let mut full = FullTree::new(MemoryStore::new());
        let mut compact = CompactedTree::new(MemoryStore::new());
        for edit in &edits {
            match edit {
                Edit::Insert { key, value, sum } => {
                    full.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                    compact.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                }
                Edit::Delete { key } => {
                    full.delete(key).unwrap();
                    compact.delete(key).unwrap();
                }
            }
        }

        let prefix = [prefix_byte; 32];
        prop_assert_eq!(
            full.subtree_root(&prefix, bit_len).unwrap(),
            compact.subtree_root(&prefix, bit_len).unwrap()
        );
    }

    #[test]
    fn compressed_proof_round_trips(edits in vec(edit_strategy(), 1..20)) {
        let mut tree = FullTree::new(MemoryStore::new());
        let mut last_key = None;
        for edit in &edits {
            if let Edit::Insert { key, value, sum } = edit {
                tree.insert(key, Leaf::new(value.clone(), *sum)).unwrap();
                last_key = Some(*key);
            }
        }

        if let Some(key) = last_key {
            let proof = tree.merkle_proof(&key).unwrap();
            let compressed = proof.compress();
            let mut buf = Vec::new();
            compressed.encode(&mut buf).unwrap();
            let decoded = taro_mssmt::CompressedProof::decode(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(decoded.decompress().unwrap(), proof);
        }
    }

    #[test]
    fn deleting_everything_restores_the_empty_root(keys in vec(0u8..12, 1..12)) {
        let mut tree = CompactedTree::new(MemoryStore::new());
        for byte in &keys {
            tree.insert(&[*byte; 32], Leaf::new(vec![*byte], 1)).unwrap();
        }
        for byte in &keys {
            tree.delete(&[*byte; 32]).unwrap();
        }
        prop_assert_eq!(tree.root().unwrap().hash, empty_tree_root());
    }
}
