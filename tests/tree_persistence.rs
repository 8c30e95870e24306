use std::cmp::Ordering;
use tarmac_index::avl::{AvlDisk, NoAnnotation, Payload, WalkOrder};
use tarmac_index::coding::DiskRecord;
use tarmac_index::Arena;
use test_log::test;

#[derive(Clone, Debug, Eq, PartialEq)]
struct Item(u32);

impl DiskRecord for Item {
    const LEN: usize = 4;

    fn write_to(&self, buf: &mut [u8]) {
        self.0.write_to(buf);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self(u32::read_from(buf))
    }
}

impl Payload for Item {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

type Tree = AvlDisk<Item, NoAnnotation>;

fn contents(tree: &Tree, arena: &Arena, root: u64) -> Vec<u32> {
    let mut out = Vec::new();
    tree.walk(arena, root, WalkOrder::Inorder, &mut |p: &Item, _, _| {
        out.push(p.0);
    })
    .unwrap();
    out
}

#[test]
fn clone_then_remove_median_leaves_original_intact() {
    let mut arena = Arena::new_in_memory();
    arena.alloc(16).unwrap();
    let tree = Tree::new_refcounted(&arena);

    const N: u32 = 1023;
    let mut root_a = 0;
    for i in 0..N {
        // Insertion order scrambled by modular multiplication.
        root_a = tree
            .insert(&mut arena, root_a, Item((i * 131) % N))
            .unwrap();
    }

    let before: Vec<u32> = (0..N).collect();
    assert_eq!(before, contents(&tree, &arena, root_a));

    let used_before = arena.curr_offset();
    let root_b = tree.clone_tree(&mut arena, root_a).unwrap();
    assert_eq!(used_before, arena.curr_offset(), "cloning allocates nothing");

    let median = N / 2;
    let (root_b, removed) = tree.remove(&mut arena, root_b, &Item(median)).unwrap();
    assert_eq!(Some(Item(median)), removed);

    // The original root still sees every item, including the median.
    assert_eq!(before, contents(&tree, &arena, root_a));
    assert_eq!(
        Some(Item(median)),
        tree.find(&arena, root_a, &Item(median)).unwrap().map(|x| x.0)
    );

    // The clone sees everything except the median.
    let mut after = before.clone();
    after.retain(|&x| x != median);
    assert_eq!(after, contents(&tree, &arena, root_b));

    // Only the rewritten spine was allocated: a handful of nodes, not a
    // copy of the tree. An AVL over 1023 items is at most 14 levels
    // deep, and a removal touches at most a few nodes per level.
    let node_len = 24 + Item::LEN;
    let grown = (arena.curr_offset() - used_before) as usize;
    assert!(
        grown <= 4 * 16 * node_len,
        "removal should copy one spine, grew by {grown} bytes"
    );

    tree.free_tree(&mut arena, root_b).unwrap();
    assert_eq!(before, contents(&tree, &arena, root_a));
}

#[test]
fn committed_roots_survive_later_updates() {
    let mut arena = Arena::new_in_memory();
    arena.alloc(16).unwrap();
    let mut tree = Tree::new(&arena);

    let mut root = 0;
    let mut snapshots = Vec::new();
    for generation in 0..10u32 {
        for i in 0..50 {
            root = tree
                .insert(&mut arena, root, Item(generation * 50 + i))
                .unwrap();
        }
        tree.commit(&arena);
        snapshots.push((generation, root));
    }

    // Each committed snapshot still holds exactly its own prefix.
    for (generation, snaproot) in snapshots {
        let expected: Vec<u32> = (0..(generation + 1) * 50).collect();
        assert_eq!(expected, contents(&tree, &arena, snaproot));
    }
}
