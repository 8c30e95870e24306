use std::io::Write;
use tarmac_index::navigator::read_memory;
use tarmac_index::registers::{reg_offset, REG_32_R0, REG_32_R1};
use tarmac_index::{
    run_indexer, IndexParams, IndexReader, SilentReporter, TracePair, MEM_TYPE_REGISTER,
};
use test_log::test;

const TRACE: &str = "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
10 clk R r0 00000001
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
20 clk R r1 00000002
";

fn build(dir: &std::path::Path) -> (TracePair, IndexReader) {
    let tarmac = dir.join("trace.tarmac");
    std::fs::File::create(&tarmac)
        .and_then(|mut f| f.write_all(TRACE.as_bytes()))
        .unwrap();

    let trace = TracePair::for_trace(tarmac);
    run_indexer(&trace, IndexParams::default(), &SilentReporter).unwrap();
    let index = IndexReader::open(&trace).unwrap();
    (trace, index)
}

#[test]
fn sequence_tree_has_one_node_per_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let (_trace, index) = build(dir.path());

    let first = index.find_buffer_limit(false).unwrap().unwrap();
    let last = index.find_buffer_limit(true).unwrap().unwrap();

    assert_eq!(10, first.mod_time);
    assert_eq!(0x1000, first.pc);
    assert_eq!(1, first.trace_file_firstline);
    assert_eq!(2, first.trace_file_lines);

    assert_eq!(20, last.mod_time);
    assert_eq!(0x1004, last.pc);
    assert_eq!(3, last.trace_file_firstline);
    assert_eq!(2, last.trace_file_lines);

    // Exactly two nodes: the neighbours meet in the middle.
    assert_eq!(
        last.trace_file_firstline,
        index
            .get_next_node(&first)
            .unwrap()
            .unwrap()
            .trace_file_firstline
    );
    assert!(index.get_next_node(&last).unwrap().is_none());
    assert!(index.get_previous_node(&first).unwrap().is_none());
}

#[test]
fn node_at_time_rounds_down() {
    let dir = tempfile::tempdir().unwrap();
    let (_trace, index) = build(dir.path());

    assert_eq!(10, index.node_at_time(10).unwrap().unwrap().mod_time);
    assert_eq!(10, index.node_at_time(15).unwrap().unwrap().mod_time);
    assert_eq!(20, index.node_at_time(20).unwrap().unwrap().mod_time);
    assert_eq!(20, index.node_at_time(1000).unwrap().unwrap().mod_time);
    assert!(index.node_at_time(9).unwrap().is_none());
}

#[test]
fn register_state_per_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (_trace, index) = build(dir.path());

    let at10 = index.node_at_time(10).unwrap().unwrap();
    let at20 = index.node_at_time(20).unwrap().unwrap();

    // r0 was written at time 10.
    let (_, bytes, def) = read_memory(
        &index,
        at10.memory_root,
        MEM_TYPE_REGISTER,
        reg_offset(&REG_32_R0),
        4,
    )
    .unwrap();
    assert_eq!(vec![1, 0, 0, 0], bytes);
    assert!(def.iter().all(|&d| d));

    // r1 is still undefined at time 10...
    let (_, _, def) = read_memory(
        &index,
        at10.memory_root,
        MEM_TYPE_REGISTER,
        reg_offset(&REG_32_R1),
        4,
    )
    .unwrap();
    assert!(def.iter().all(|&d| !d));

    // ...and defined at time 20, along with the still-visible r0.
    let (_, bytes, def) = read_memory(
        &index,
        at20.memory_root,
        MEM_TYPE_REGISTER,
        reg_offset(&REG_32_R1),
        4,
    )
    .unwrap();
    assert_eq!(vec![2, 0, 0, 0], bytes);
    assert!(def.iter().all(|&d| d));

    assert_eq!(
        Some(1),
        index.get_reg_value(at20.memory_root, &REG_32_R0).unwrap()
    );
}

#[test]
fn line_and_pc_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let (_trace, index) = build(dir.path());

    assert_eq!(1, index.node_at_line(1).unwrap().unwrap().trace_file_firstline);
    assert_eq!(1, index.node_at_line(2).unwrap().unwrap().trace_file_firstline);
    assert_eq!(3, index.node_at_line(3).unwrap().unwrap().trace_file_firstline);
    assert!(index.node_at_line(5).unwrap().is_none());

    assert_eq!(Some(1), index.find_next_visit_to_pc(0x1000, 0, 1).unwrap());
    assert_eq!(Some(3), index.find_next_visit_to_pc(0x1004, 1, 1).unwrap());
    assert_eq!(None, index.find_next_visit_to_pc(0x1000, 1, 1).unwrap());
    assert_eq!(Some(3), index.find_next_visit_to_pc(0x1004, 100, -1).unwrap());
    assert_eq!(None, index.find_next_visit_to_pc(0x2000, 0, 1).unwrap());
}

#[test]
fn trace_text_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (_trace, index) = build(dir.path());

    let at10 = index.node_at_time(10).unwrap().unwrap();
    let lines = index.get_trace_lines(&at10).unwrap();
    assert_eq!(
        vec![
            "10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1".to_string(),
            "10 clk R r0 00000001".to_string(),
        ],
        lines
    );
    assert_eq!("10 clk R r0 00000001", index.get_trace_line(&at10, 1).unwrap());
}

#[test]
fn fatal_parse_error_is_positioned_and_leaves_no_index() {
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};
    use tarmac_index::Reporter;

    #[derive(Default)]
    struct ErrorRecorder {
        errors: RefCell<Vec<(PathBuf, u64, String)>>,
    }

    impl Reporter for ErrorRecorder {
        fn indexing_error(&self, trace_file: &Path, lineno: u64, msg: &str) {
            self.errors
                .borrow_mut()
                .push((trace_file.to_path_buf(), lineno, msg.to_string()));
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let tarmac = dir.path().join("bad.tarmac");
    std::fs::File::create(&tarmac)
        .and_then(|mut f| {
            f.write_all(
                b"10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1\n\
                  20 clk IT (2) zzzz A svc_mode : MOV r1,#2\n\
                  30 clk IT (3) 00001008:e3a00003 A svc_mode : MOV r2,#3\n",
            )
        })
        .unwrap();

    let trace = TracePair::for_trace(tarmac);
    let reporter = ErrorRecorder::default();
    let result = run_indexer(&trace, IndexParams::default(), &reporter);

    assert!(matches!(result, Err(tarmac_index::Error::Parse(_))));
    assert!(
        !trace.index_filename.exists(),
        "a failed build must not leave a partial index"
    );

    // The fatal report carries the same file/line context a recoverable
    // warning would.
    let errors = reporter.errors.borrow();
    let [(file, lineno, msg)] = &errors[..] else {
        panic!("expected exactly one indexing error")
    };
    assert_eq!(&trace.tarmac_filename, file);
    assert_eq!(2, *lineno);
    assert!(msg.contains("expected a hex value"));
}

#[test]
fn incomplete_index_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (trace, index) = build(dir.path());
    drop(index);

    // Clear the completion flag in the header (byte 10..14 holds the
    // flags word; COMPLETE is bit 0 of the last byte).
    let mut bytes = std::fs::read(&trace.index_filename).unwrap();
    bytes[13] &= !1;
    std::fs::write(&trace.index_filename, &bytes).unwrap();

    assert!(matches!(
        IndexReader::open(&trace),
        Err(tarmac_index::Error::CorruptIndex(_))
    ));
}
