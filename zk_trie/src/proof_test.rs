use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::byte32::Byte32;
use crate::db::{MemoryDb, ZktrieDatabase};
use crate::hash::Hash;
use crate::node::{BranchType, Node};
use crate::proof::{
    build_proof, decode_smt_proof, verify_proof, Proof, MAGIC_HASH, MAGIC_SMT_BYTES,
};
use crate::trie::{to_secure_key, ZkTrie, ZkTrieError};

fn new_trie() -> ZkTrie<MemoryDb> {
    ZkTrie::new(Arc::new(MemoryDb::new()), Hash::ZERO).unwrap()
}

fn value(byte: u8) -> Vec<Byte32> {
    vec![Byte32::from([byte; 32])]
}

fn set(t: &mut ZkTrie<MemoryDb>, key: &[u8], byte: u8) {
    t.update(key, 1, value(byte)).unwrap();
}

#[test]
fn existence_proof_verifies() {
    let mut t = new_trie();
    for i in 0u8..8 {
        set(&mut t, &[b'k', i], i + 1);
    }
    let root = t.root().unwrap();
    for i in 0u8..8 {
        let node_key = to_secure_key(&[b'k', i]).unwrap();
        let (proof, node) =
            build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
        assert!(proof.existence);
        assert!(verify_proof(&root, &proof, &node));
        // The proof pins the value; a different root must not verify.
        assert!(!verify_proof(&Hash::from_bytes(&[1]), &proof, &node));
    }
}

#[test]
fn single_leaf_proof_has_depth_zero() {
    let mut t = new_trie();
    set(&mut t, b"only", 9);
    let root = t.root().unwrap();
    let node_key = to_secure_key(b"only").unwrap();
    let (proof, node) = build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
    assert!(proof.existence);
    assert_eq!(proof.depth, 0);
    assert!(proof.siblings.is_empty());
    assert!(verify_proof(&root, &proof, &node));
}

#[test]
fn nonexistence_proof_with_foreign_leaf() {
    let mut t = new_trie();
    set(&mut t, b"present", 1);
    let root = t.root().unwrap();
    // With a single leaf at the root, any other key lands on it.
    let node_key = to_secure_key(b"absent").unwrap();
    let (proof, node) = build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
    assert!(!proof.existence);
    let aux = proof.node_aux.unwrap();
    assert_eq!(aux.key, to_secure_key(b"present").unwrap());
    assert!(verify_proof(&root, &proof, &node));
}

#[test]
fn nonexistence_proof_with_empty_termination() {
    let db = Arc::new(MemoryDb::new());
    let mut t = ZkTrie::new_with_max_levels(db, Hash::ZERO, 4).unwrap();
    // Paths (lsb first): 1000 and 1100 occupy the right subtree only.
    let k1 = Hash::from_bytes(&[1]);
    let k3 = Hash::from_bytes(&[3]);
    t.update_node_key(&k1, 1, value(1)).unwrap();
    t.update_node_key(&k3, 1, value(3)).unwrap();
    let root = t.root().unwrap();
    // Path 0010 walks into the empty left child of the root.
    let absent = Hash::from_bytes(&[4]);
    let (proof, node) = build_proof(&root, &absent, 4, |h| t.get_node(h)).unwrap();
    assert!(!proof.existence);
    assert!(proof.node_aux.is_none());
    assert_eq!(node, Node::Empty);
    assert!(verify_proof(&root, &proof, &node));
}

#[test]
fn proof_serialization_round_trip() {
    let mut t = new_trie();
    for i in 0u8..8 {
        set(&mut t, &[b'k', i], i + 1);
    }
    let root = t.root().unwrap();
    let node_key = to_secure_key(b"k\x03").unwrap();
    let (proof, node) = build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
    let bytes = proof.to_bytes().unwrap();
    let parsed = Proof::from_bytes(&node_key, &bytes).unwrap();
    assert_eq!(parsed, proof);
    assert!(verify_proof(&root, &parsed, &node));
}

#[test]
fn mutated_proof_bytes_never_verify() {
    let mut t = new_trie();
    for i in 0u8..8 {
        set(&mut t, &[b'k', i], i + 1);
    }
    let root = t.root().unwrap();
    let node_key = to_secure_key(b"k\x05").unwrap();
    let (proof, node) = build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
    let bytes = proof.to_bytes().unwrap();
    for bit in 0..bytes.len() * 8 {
        let mut mutated = bytes.clone();
        mutated[bit / 8] ^= 1 << (bit % 8);
        if let Ok(p) = Proof::from_bytes(&node_key, &mutated) {
            assert!(!verify_proof(&root, &p, &node), "flipped bit {bit} verified");
        }
    }
}

#[test]
fn claiming_a_different_value_fails() {
    let mut t = new_trie();
    set(&mut t, b"key", 1);
    set(&mut t, b"other", 2);
    let root = t.root().unwrap();
    let node_key = to_secure_key(b"key").unwrap();
    let (proof, _) = build_proof(&root, &node_key, t.max_levels(), |h| t.get_node(h)).unwrap();
    let forged = Node::leaf(node_key, 1, value(0xee));
    assert!(!verify_proof(&root, &proof, &forged));
}

#[test]
fn proof_db_walk_reaches_the_leaf() {
    let mut t = new_trie();
    for i in 0u8..6 {
        set(&mut t, &[b's', i], i + 1);
    }
    let proof_db = MemoryDb::new();
    let key = [b's', 2];
    t.prove(&key, &proof_db).unwrap();
    assert_eq!(
        proof_db.get(MAGIC_HASH).unwrap().as_deref(),
        Some(MAGIC_SMT_BYTES)
    );

    let root = t.root().unwrap();
    let node_key = to_secure_key(&key).unwrap();
    let mut next = root;
    for lvl in 0..t.max_levels() {
        let bytes = proof_db.get(&next.bytes()).unwrap().unwrap();
        let node = decode_smt_proof(&bytes).unwrap().unwrap();
        match node {
            Node::Branch(b) => {
                next = if node_key.bit(lvl) {
                    b.child_right
                } else {
                    b.child_left
                };
            }
            Node::Leaf(leaf) => {
                assert_eq!(leaf.node_key, node_key);
                assert_eq!(leaf.value_preimage, value(3));
                return;
            }
            Node::Empty => panic!("existence path hit an empty node"),
        }
    }
    panic!("proof db walk never reached the leaf");
}

#[test]
fn depth4_fixture_proofs_reproduce_direct_roots() {
    let db = Arc::new(MemoryDb::new());
    let mut t = ZkTrie::new_with_max_levels(db, Hash::ZERO, 4).unwrap();
    // Low path bits (lsb first): 0100, 1000, 1010, then 1111.
    let k2 = Hash::from_bytes(&[2]);
    let k1 = Hash::from_bytes(&[1]);
    let k5 = Hash::from_bytes(&[5]);
    let k15 = Hash::from_bytes(&[15]);
    let ops: [(&Hash, u8); 5] = [(&k2, 1), (&k1, 2), (&k5, 3), (&k5, 4), (&k15, 5)];
    for (key, v) in ops {
        t.update_node_key(key, 1, value(v)).unwrap();
        let root = t.root().unwrap();
        // The proof built right after each mutation must replay to the
        // root that direct mutation produced.
        let (proof, node) = build_proof(&root, key, 4, |h| t.get_node(h)).unwrap();
        assert!(proof.existence);
        assert!(verify_proof(&root, &proof, &node));
        assert_eq!(
            proof.root_from_proof(&node.node_hash().unwrap(), key).unwrap(),
            root
        );
    }
}

#[test]
fn deleting_one_of_two_leaves_emits_the_survivor() {
    let mut t = new_trie();
    set(&mut t, b"doomed", 1);
    set(&mut t, b"survivor", 2);
    t.root().unwrap();

    let proof_db = MemoryDb::new();
    let mut tracer = t.new_proof_tracer().unwrap();
    tracer.prove(b"doomed", &proof_db).unwrap();
    tracer.prove(b"survivor", &proof_db).unwrap();
    tracer.mark_deletion(b"doomed").unwrap();

    let witnesses = tracer.get_deletion_proofs().unwrap();
    let survivor = t.get_leaf_node_by_key(b"survivor").unwrap();
    assert_eq!(witnesses, vec![survivor.bytes()]);
}

#[test]
fn unmarked_tracer_emits_nothing() {
    let mut t = new_trie();
    set(&mut t, b"a", 1);
    set(&mut t, b"b", 2);
    let proof_db = MemoryDb::new();
    let mut tracer = t.new_proof_tracer().unwrap();
    tracer.prove(b"a", &proof_db).unwrap();
    tracer.prove(b"b", &proof_db).unwrap();
    assert!(tracer.get_deletion_proofs().unwrap().is_empty());
    // Marking a key that was never proven is tolerated.
    tracer.mark_deletion(b"unseen").unwrap();
    assert!(tracer.get_deletion_proofs().unwrap().is_empty());
}

#[test]
fn marking_an_absent_key_promotes_its_path() {
    let mut t = new_trie();
    for i in 0u8..4 {
        set(&mut t, &[b'm', i], i + 1);
    }
    let proof_db = MemoryDb::new();
    let mut tracer = t.new_proof_tracer().unwrap();
    tracer.prove(b"not-there", &proof_db).unwrap();
    tracer.mark_deletion(b"not-there").unwrap();
    // A path ending in an empty slot may still surface the sibling next to
    // that slot; every emitted witness must be a well-formed trie node.
    for witness in tracer.get_deletion_proofs().unwrap() {
        let node = Node::from_bytes(&witness).unwrap();
        assert!(!node.node_hash().unwrap().is_zero());
    }
    // The trie itself is untouched by the marking.
    let root = t.root().unwrap();
    t.delete(b"not-there").unwrap();
    assert_eq!(t.root().unwrap(), root);
}

#[test]
fn merging_tracers_unions_their_markings() {
    let mut t = new_trie();
    set(&mut t, b"left", 1);
    set(&mut t, b"right", 2);
    set(&mut t, b"keep", 3);
    t.root().unwrap();

    let proof_db = MemoryDb::new();
    let mut t1 = t.new_proof_tracer().unwrap();
    t1.prove(b"left", &proof_db).unwrap();
    t1.mark_deletion(b"left").unwrap();
    let mut t2 = t.new_proof_tracer().unwrap();
    t2.prove(b"right", &proof_db).unwrap();
    t2.mark_deletion(b"right").unwrap();
    t1.merge(t2).unwrap();
    let merged: HashSet<Vec<u8>> = t1.get_deletion_proofs().unwrap().into_iter().collect();

    let mut both = t.new_proof_tracer().unwrap();
    both.prove(b"left", &proof_db).unwrap();
    both.prove(b"right", &proof_db).unwrap();
    both.mark_deletion(b"left").unwrap();
    both.mark_deletion(b"right").unwrap();
    let expect: HashSet<Vec<u8>> = both.get_deletion_proofs().unwrap().into_iter().collect();
    assert_eq!(merged, expect);
}

#[test]
fn merging_over_different_roots_fails() {
    let mut t = new_trie();
    set(&mut t, b"a", 1);
    let t1 = t.new_proof_tracer().unwrap();
    set(&mut t, b"b", 2);
    let mut t2 = t.new_proof_tracer().unwrap();
    assert_eq!(t2.merge(t1), Err(ZkTrieError::TracerRootMismatch));
}

/// Replays a deletion batch from witnesses alone: proof-db nodes plus the
/// emitted deletion witnesses must reconstruct the post-deletion root.
#[test]
fn deletion_witnesses_support_replay() {
    let mut t = new_trie();
    let keys: Vec<Vec<u8>> = (0u8..12).map(|i| vec![b'a', i]).collect();
    for (i, key) in keys.iter().enumerate() {
        set(&mut t, key, i as u8 + 1);
    }
    let root = t.root().unwrap();

    let proof_db = MemoryDb::new();
    let mut tracer = t.new_proof_tracer().unwrap();
    for key in &keys {
        tracer.prove(key, &proof_db).unwrap();
    }

    let doomed = [1usize, 2, 3, 7, 8];
    let mut deleted = HashSet::new();
    for &i in &doomed {
        let leaf = t.get_leaf_node_by_key(&keys[i]).unwrap();
        deleted.insert(leaf.node_hash().unwrap().bytes());
        tracer.mark_deletion(&keys[i]).unwrap();
    }
    let witnesses = tracer.get_deletion_proofs().unwrap();

    let mut store: HashMap<[u8; 32], Node> = HashMap::new();
    for (k, v) in proof_db.entries() {
        if k == MAGIC_HASH {
            continue;
        }
        if let Some(node) = decode_smt_proof(&v).unwrap() {
            store.insert(k.try_into().unwrap(), node);
        }
    }
    for w in &witnesses {
        let node = Node::from_bytes(w).unwrap();
        store.insert(node.node_hash().unwrap().bytes(), node);
    }

    let mut direct = t.copy();
    for &i in &doomed {
        direct.delete(&keys[i]).unwrap();
    }
    let expect = direct.root().unwrap();

    let (replayed, _) = rebuild(&store, &deleted, &root, false);
    assert_eq!(replayed, expect);
}

/// Rebuilds a subtree hash after deletions, collapsing exactly the way the
/// trie does: a branch with two vanished children vanishes, a terminal pair
/// with one empty side collapses into the survivor.
fn rebuild(
    store: &HashMap<[u8; 32], Node>,
    deleted: &HashSet<[u8; 32]>,
    hash: &Hash,
    terminal_hint: bool,
) -> (Hash, bool) {
    if hash.is_zero() || deleted.contains(&hash.bytes()) {
        return (Hash::ZERO, true);
    }
    match store.get(&hash.bytes()) {
        None => (*hash, terminal_hint),
        Some(Node::Empty) => (Hash::ZERO, true),
        Some(Node::Leaf(_)) => (*hash, true),
        Some(Node::Branch(b)) => {
            let (lh, lt) = rebuild(store, deleted, &b.child_left, b.kind.left_is_terminal());
            let (rh, rt) = rebuild(store, deleted, &b.child_right, b.kind.right_is_terminal());
            if lh.is_zero() && rh.is_zero() {
                return (Hash::ZERO, true);
            }
            if lt && rt {
                if lh.is_zero() {
                    return (rh, true);
                }
                if rh.is_zero() {
                    return (lh, true);
                }
            }
            let node = Node::branch(BranchType::of(lt, rt), lh, rh);
            (node.node_hash().unwrap(), false)
        }
    }
}
