use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use tarmac_index::{
    check_index_header, update_index, IndexHeaderState, IndexReader, IndexUpdateCheck, Reporter,
    TracePair, UpdateOptions,
};
use test_log::test;

const TRACE: &str = "\
10 clk IT (1) 00001000:e3a00001 A svc_mode : MOV r0,#1
20 clk IT (2) 00001004:e3a00002 A svc_mode : MOV r1,#2
";

#[derive(Default)]
struct StatusRecorder {
    statuses: RefCell<Vec<IndexUpdateCheck>>,
}

impl Reporter for StatusRecorder {
    fn indexing_status(&self, _index: &Path, _trace: &Path, status: IndexUpdateCheck) {
        self.statuses.borrow_mut().push(status);
    }
}

fn write_trace(dir: &Path) -> TracePair {
    let tarmac = dir.join("trace.tarmac");
    std::fs::File::create(&tarmac)
        .and_then(|mut f| f.write_all(TRACE.as_bytes()))
        .unwrap();
    TracePair::for_trace(tarmac)
}

fn last_status(reporter: &StatusRecorder) -> IndexUpdateCheck {
    *reporter.statuses.borrow().last().unwrap()
}

#[test]
fn missing_then_ok_then_forced() {
    let dir = tempfile::tempdir().unwrap();
    let trace = write_trace(dir.path());
    let reporter = StatusRecorder::default();

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::Missing, last_status(&reporter));
    assert!(trace.index_filename.exists());

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::Ok, last_status(&reporter));

    let opts = UpdateOptions {
        force: true,
        ..UpdateOptions::default()
    };
    update_index(&trace, &opts, &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::Forced, last_status(&reporter));
}

#[test]
fn wrong_magic_is_detected_and_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let trace = write_trace(dir.path());
    let reporter = StatusRecorder::default();

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();

    let mut bytes = std::fs::read(&trace.index_filename).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&trace.index_filename, &bytes).unwrap();
    assert_eq!(
        IndexHeaderState::WrongFormat,
        check_index_header(&trace.index_filename).unwrap()
    );

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::WrongFormat, last_status(&reporter));
    assert!(IndexReader::open(&trace).is_ok());
}

#[test]
fn incomplete_index_is_detected_and_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let trace = write_trace(dir.path());
    let reporter = StatusRecorder::default();

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();

    // Clear the COMPLETE bit of the big-endian flags word.
    let mut bytes = std::fs::read(&trace.index_filename).unwrap();
    bytes[13] &= !1;
    std::fs::write(&trace.index_filename, &bytes).unwrap();
    assert_eq!(
        IndexHeaderState::Incomplete,
        check_index_header(&trace.index_filename).unwrap()
    );

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::Incomplete, last_status(&reporter));
    assert!(IndexReader::open(&trace).is_ok());
}

#[test]
fn stale_index_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let trace = write_trace(dir.path());
    let reporter = StatusRecorder::default();

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();

    // Rewrite the trace so its mtime moves past the index's.
    std::thread::sleep(std::time::Duration::from_millis(50));
    std::fs::File::create(&trace.tarmac_filename)
        .and_then(|mut f| f.write_all(TRACE.as_bytes()))
        .unwrap();

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::TooOld, last_status(&reporter));

    update_index(&trace, &UpdateOptions::default(), &reporter).unwrap();
    assert_eq!(IndexUpdateCheck::Ok, last_status(&reporter));
}

#[test]
fn in_memory_index_skips_the_disk() {
    let dir = tempfile::tempdir().unwrap();
    let trace = write_trace(dir.path());
    let reporter = StatusRecorder::default();

    let opts = UpdateOptions {
        in_memory: true,
        ..UpdateOptions::default()
    };
    let arena = update_index(&trace, &opts, &reporter)
        .unwrap()
        .expect("in-memory mode returns the arena");
    assert_eq!(IndexUpdateCheck::InMemory, last_status(&reporter));
    assert!(!trace.index_filename.exists());

    let index = IndexReader::from_arena(arena, &trace.tarmac_filename).unwrap();
    assert_eq!(2, {
        let mut count = 0;
        let mut node = index.find_buffer_limit(false).unwrap();
        while let Some(n) = node {
            count += 1;
            node = index.get_next_node(&n).unwrap();
        }
        count
    });
}
