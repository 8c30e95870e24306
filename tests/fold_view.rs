use std::io::Write;
use tarmac_index::{
    run_indexer, FoldedView, IndexParams, IndexReader, SilentReporter, TracePair,
};
use test_log::test;

// Same shape as the call/return scenario: a two-line callee at depth 1
// on lines 5 and 6.
const TRACE: &str = "\
5 clk R sp 00004000
10 clk IT (1) 00008000:e3a00001 A svc : MOV r0,#1
20 clk IT (2) 00008004:eb0003fd A svc : BL foo
20 clk R r14 00008008
30 clk IT (3) 00009000:e3a01002 A svc : MOV r1,#2
40 clk IT (4) 00009004:e12fff1e A svc : BX lr
50 clk IT (5) 00008008:e3a02003 A svc : MOV r2,#3
60 clk IT (6) 0000800c:e3a03004 A svc : MOV r3,#4
";

fn build(dir: &std::path::Path) -> IndexReader {
    let tarmac = dir.join("fold.tarmac");
    std::fs::File::create(&tarmac)
        .and_then(|mut f| f.write_all(TRACE.as_bytes()))
        .unwrap();

    let trace = TracePair::for_trace(tarmac);
    run_indexer(&trace, IndexParams::default(), &SilentReporter).unwrap();
    IndexReader::open(&trace).unwrap()
}

#[test]
fn unfolded_view_is_the_identity() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(dir.path());
    let view = FoldedView::new(&index).unwrap();

    assert_eq!(8, view.total_visible_lines());
    for phys in 1..=8u32 {
        let vis = view.physical_to_visible_line(phys).unwrap().unwrap();
        assert_eq!(phys - 1, vis);
        assert_eq!(
            phys,
            view.visible_to_physical_line(vis).unwrap().unwrap()
        );
    }
}

#[test]
fn folding_a_region_hides_its_lines() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(dir.path());
    let mut view = FoldedView::new(&index).unwrap();

    // Hide everything inside lines 5..=6.
    view.set_fold_state(5, 6, 0, 0).unwrap();
    assert_eq!(6, view.total_visible_lines());

    // Every physical line inside the folded region maps to the same
    // visible position as its start.
    assert_eq!(
        view.physical_to_visible_line(5).unwrap(),
        view.physical_to_visible_line(6).unwrap()
    );

    // The round trip is exact for lines in unfolded regions.
    for phys in [1u32, 2, 3, 4, 7, 8] {
        let vis = view.physical_to_visible_line(phys).unwrap().unwrap();
        assert_eq!(
            phys,
            view.visible_to_physical_line(vis).unwrap().unwrap()
        );
    }

    // Visible numbering skips the folded body: line 7 directly follows
    // line 4.
    let vis4 = view.physical_to_visible_line(4).unwrap().unwrap();
    let vis7 = view.physical_to_visible_line(7).unwrap().unwrap();
    assert_eq!(vis4 + 1, vis7);

    // And the weaker direction of the round-trip law holds everywhere.
    for phys in 1..=8u32 {
        let vis = view.physical_to_visible_line(phys).unwrap().unwrap();
        assert!(view.visible_to_physical_line(vis).unwrap().unwrap() >= phys.min(7));
    }
}

#[test]
fn unfolding_restores_the_identity() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(dir.path());
    let mut view = FoldedView::new(&index).unwrap();

    view.set_fold_state(5, 6, 0, 0).unwrap();
    assert_eq!(6, view.total_visible_lines());

    view.set_fold_state(5, 6, 0, u32::MAX).unwrap();
    assert_eq!(8, view.total_visible_lines());
    for phys in 1..=8u32 {
        let vis = view.physical_to_visible_line(phys).unwrap().unwrap();
        assert_eq!(phys - 1, vis);
    }
}

#[test]
fn overlapping_folds_clip_existing_regions() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(dir.path());
    let mut view = FoldedView::new(&index).unwrap();

    // Fold a larger range, then re-open just its middle; the clipped
    // remainders must keep tiling the file.
    view.set_fold_state(3, 8, 0, 0).unwrap();
    assert_eq!(2, view.total_visible_lines());

    view.set_fold_state(5, 6, 0, u32::MAX).unwrap();

    let r4 = view.region_at_line(4).unwrap();
    assert_eq!((3, 4), (r4.first_physical_line, r4.last_physical_line));
    let r5 = view.region_at_line(5).unwrap();
    assert_eq!((5, 6), (r5.first_physical_line, r5.last_physical_line));
    let r7 = view.region_at_line(7).unwrap();
    assert_eq!((7, 8), (r7.first_physical_line, r7.last_physical_line));

    // Lines 1-2 and 5-6 are visible; 3-4 and 7-8 are folded away.
    assert_eq!(4, view.total_visible_lines());
}

#[test]
fn visible_node_lookup_lands_inside_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(dir.path());
    let view = FoldedView::new(&index).unwrap();

    // Visible line 3 is physical line 4, the second line of the node
    // starting at line 3.
    let (node, offset) = view.get_node_by_visline(3).unwrap().unwrap();
    assert_eq!(3, node.trace_file_firstline);
    assert_eq!(1, offset);
}
