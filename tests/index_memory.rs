use std::io::Write;
use tarmac_index::navigator::read_memory;
use tarmac_index::{
    run_indexer, IndexParams, IndexReader, SilentReporter, TracePair, MEM_TYPE_MEMORY,
};
use test_log::test;

fn build(dir: &std::path::Path, name: &str, trace_text: &str, bigend: bool) -> IndexReader {
    let tarmac = dir.join(name);
    std::fs::File::create(&tarmac)
        .and_then(|mut f| f.write_all(trace_text.as_bytes()))
        .unwrap();

    let trace = TracePair::for_trace(tarmac);
    let params = IndexParams {
        bigend,
        ..IndexParams::default()
    };
    run_indexer(&trace, params, &SilentReporter).unwrap();
    IndexReader::open(&trace).unwrap()
}

#[test]
fn write_then_read_little_endian() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "mem.tarmac",
        "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
10 clk MW4 00010000 DEADBEEF
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
20 clk MR4 00010000 DEADBEEF
",
        false,
    );

    let last = index.find_buffer_limit(true).unwrap().unwrap();
    let (line, bytes, def) =
        read_memory(&index, last.memory_root, MEM_TYPE_MEMORY, 0x10000, 4).unwrap();
    assert_eq!(vec![0xEF, 0xBE, 0xAD, 0xDE], bytes);
    assert!(def.iter().all(|&d| d));
    // Regions are stamped with the first line of the node that wrote
    // them; the MW4 sits in the node starting at line 1.
    assert_eq!(1, line);

    // Bytes around the write stay undefined.
    let (_, _, def) = read_memory(&index, last.memory_root, MEM_TYPE_MEMORY, 0x10004, 4).unwrap();
    assert!(def.iter().all(|&d| !d));
}

#[test]
fn diagram_store_big_endian() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "diagram.tarmac",
        "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
10 clk ST 00020000 DEADBEEF........................
",
        true,
    );

    // The 16-byte diagram reads highest-address-leftmost, so the run
    // lands at base + 12 and its bytes are the same in either system
    // endianness.
    let last = index.find_buffer_limit(true).unwrap().unwrap();
    let (_, bytes, def) =
        read_memory(&index, last.memory_root, MEM_TYPE_MEMORY, 0x2000C, 4).unwrap();
    assert!(def.iter().all(|&d| d));
    assert_eq!(vec![0xEF, 0xBE, 0xAD, 0xDE], bytes);

    let (_, _, def) = read_memory(&index, last.memory_root, MEM_TYPE_MEMORY, 0x20000, 12).unwrap();
    assert!(def.iter().all(|&d| !d));
}

#[test]
fn memory_reads_fill_in_history_retroactively() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "retro.tarmac",
        "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
30 clk IT (3) 00001008:e5912000 A svc_mode : LDR r2,[r1]
30 clk MR4 00030000 CAFEF00D
",
        false,
    );

    // The read at time 30 teaches us what those bytes have held all
    // along: the snapshot at time 10 sees them too.
    let at10 = index.node_at_time(10).unwrap().unwrap();
    let (_, bytes, def) = read_memory(&index, at10.memory_root, MEM_TYPE_MEMORY, 0x30000, 4).unwrap();
    assert!(def.iter().all(|&d| d));
    assert_eq!(vec![0x0D, 0xF0, 0xFE, 0xCA], bytes);
}

#[test]
fn writes_shadow_earlier_reads_but_only_forward() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "shadow.tarmac",
        "\
10 clk IT (1) 00001000:e5912000 A svc_mode : LDR r2,[r1]
10 clk MR4 00030000 11111111
20 clk IT (2) 00001004:e5812000 A svc_mode : STR r2,[r1]
20 clk MW4 00030000 22222222
30 clk IT (3) 00001008:e3a00002 A svc_mode : MOV r0,#2
",
        false,
    );

    let at10 = index.node_at_time(10).unwrap().unwrap();
    let at30 = index.node_at_time(30).unwrap().unwrap();

    let (_, bytes, _) = read_memory(&index, at10.memory_root, MEM_TYPE_MEMORY, 0x30000, 4).unwrap();
    assert_eq!(vec![0x11; 4], bytes);

    let (_, bytes, _) = read_memory(&index, at30.memory_root, MEM_TYPE_MEMORY, 0x30000, 4).unwrap();
    assert_eq!(vec![0x22; 4], bytes);
}

#[test]
fn partial_overwrite_preserves_neighbours() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "partial.tarmac",
        "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
10 clk MW8 00040000 1122334455667788
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
20 clk MW2 00040003 AABB
",
        false,
    );

    let last = index.find_buffer_limit(true).unwrap().unwrap();
    let (_, bytes, def) =
        read_memory(&index, last.memory_root, MEM_TYPE_MEMORY, 0x40000, 8).unwrap();
    assert!(def.iter().all(|&d| d));
    // Little-endian MW8, with two bytes punched out at +3.
    assert_eq!(vec![0x88, 0x77, 0x66, 0xBB, 0xAA, 0x33, 0x22, 0x11], bytes);
}

#[test]
fn find_next_mod_locates_changed_region() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        dir.path(),
        "nextmod.tarmac",
        "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
10 clk MW4 00010000 DEADBEEF
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
20 clk MW4 00020000 CAFEF00D
30 clk IT (3) 00001008:e3a00003 A svc_mode : MOV r2,#3
",
        false,
    );

    let last = index.find_buffer_limit(true).unwrap().unwrap();
    let root = last.memory_root;

    // The two writes landed in the nodes starting at lines 1 and 3.
    // Looking upward from address 0 for anything written at line 3 or
    // later skips the first region.
    let hit = index
        .find_next_mod(root, MEM_TYPE_MEMORY, 0, 3, 1)
        .unwrap()
        .expect("a modified region exists");
    assert_eq!((0x20000, 0x20003), hit);

    // With the threshold at line 1, the nearer region wins.
    let hit = index
        .find_next_mod(root, MEM_TYPE_MEMORY, 0, 1, 1)
        .unwrap()
        .expect("a modified region exists");
    assert_eq!((0x10000, 0x10003), hit);

    // And searching downward from high addresses finds the later write
    // first.
    let hit = index
        .find_next_mod(root, MEM_TYPE_MEMORY, 0x7FFF_0000, 1, -1)
        .unwrap()
        .expect("a modified region exists");
    assert_eq!((0x20000, 0x20003), hit);

    // Nothing is newer than line 4.
    assert!(index
        .find_next_mod(root, MEM_TYPE_MEMORY, 0, 4, 1)
        .unwrap()
        .is_none());
}
