// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The same balanced annotated map as [`crate::avl`], but in plain memory.
//!
//! Per-view state (fold regions) is small, mutable and never persisted, so
//! it gets boxed nodes instead of arena offsets. The annotation fold and
//! the searcher protocol are identical to the disk tree's.

use std::cmp::Ordering;

/// Payload contract for the in-memory tree.
pub trait MemPayload: Clone {
    fn cmp_payload(&self, other: &Self) -> Ordering;
}

/// Annotation contract for the in-memory tree.
pub trait MemAnnotation<P>: Clone {
    fn from_payload(payload: &P) -> Self;
    fn combine(lhs: &Self, rhs: &Self) -> Self;
}

/// Direction decision returned by a search callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemSearchStep {
    Left,
    Right,
    Stop,
    Abort,
}

struct Node<P, A> {
    lc: Option<Box<Node<P, A>>>,
    rc: Option<Box<Node<P, A>>>,
    height: u32,
    payload: P,
    annotation: A,
}

fn height<P, A>(n: &Option<Box<Node<P, A>>>) -> u32 {
    n.as_ref().map_or(0, |n| n.height)
}

/// Balanced ordered map with subtree annotations, held in RAM.
pub struct AvlMem<P, A> {
    root: Option<Box<Node<P, A>>>,
}

impl<P: MemPayload, A: MemAnnotation<P>> Default for AvlMem<P, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemPayload, A: MemAnnotation<P>> AvlMem<P, A> {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    fn rewrite(
        mut n: Box<Node<P, A>>,
        lc: Option<Box<Node<P, A>>>,
        rc: Option<Box<Node<P, A>>>,
    ) -> Box<Node<P, A>> {
        n.height = height(&lc).max(height(&rc)) + 1;
        n.annotation = A::from_payload(&n.payload);
        if let Some(lc) = &lc {
            n.annotation = A::combine(&lc.annotation, &n.annotation);
        }
        if let Some(rc) = &rc {
            n.annotation = A::combine(&n.annotation, &rc.annotation);
        }
        n.lc = lc;
        n.rc = rc;
        n
    }

    fn rotate_left(mut n: Box<Node<P, A>>) -> Box<Node<P, A>> {
        let mut rc = n.rc.take().expect("rotate_left requires a right child");
        let t0 = n.lc.take();
        let t1 = rc.lc.take();
        let t2 = rc.rc.take();
        let n = Self::rewrite(n, t0, t1);
        Self::rewrite(rc, Some(n), t2)
    }

    fn rotate_right(mut n: Box<Node<P, A>>) -> Box<Node<P, A>> {
        let mut lc = n.lc.take().expect("rotate_right requires a left child");
        let t0 = lc.lc.take();
        let t1 = lc.rc.take();
        let t2 = n.rc.take();
        let n = Self::rewrite(n, t1, t2);
        Self::rewrite(lc, t0, Some(n))
    }

    fn rebalance(root: Box<Node<P, A>>) -> Box<Node<P, A>> {
        let mut root = root;
        let (lh, rh) = (height(&root.lc), height(&root.rc));

        if lh == rh + 2 {
            let lc = root.lc.take().expect("left-heavy implies a left child");
            let lc = if height(&lc.rc) == rh + 1 {
                Self::rotate_left(lc)
            } else {
                lc
            };
            let rc = root.rc.take();
            let root = Self::rewrite(root, Some(lc), rc);
            Self::rotate_right(root)
        } else if rh == lh + 2 {
            let rc = root.rc.take().expect("right-heavy implies a right child");
            let rc = if height(&rc.lc) == lh + 1 {
                Self::rotate_right(rc)
            } else {
                rc
            };
            let lc = root.lc.take();
            let root = Self::rewrite(root, lc, Some(rc));
            Self::rotate_left(root)
        } else {
            let lc = root.lc.take();
            let rc = root.rc.take();
            Self::rewrite(root, lc, rc)
        }
    }

    fn insert_main(root: Option<Box<Node<P, A>>>, n: Box<Node<P, A>>) -> Box<Node<P, A>> {
        let Some(mut root) = root else {
            return n;
        };

        let cmp = root.payload.cmp_payload(&n.payload);
        assert_ne!(
            Ordering::Equal,
            cmp,
            "insert: payload compares equal to an existing payload"
        );

        if cmp == Ordering::Greater {
            let lc = Self::insert_main(root.lc.take(), n);
            root.lc = Some(lc);
        } else {
            let rc = Self::insert_main(root.rc.take(), n);
            root.rc = Some(rc);
        }
        Self::rebalance(root)
    }

    /// Inserts `payload`. Panics on an equal existing payload.
    pub fn insert(&mut self, payload: P) {
        let annotation = A::from_payload(&payload);
        let n = Box::new(Node {
            lc: None,
            rc: None,
            height: 1,
            payload,
            annotation,
        });
        self.root = Some(Self::insert_main(self.root.take(), n));
    }

    fn remove_main(
        root: Option<Box<Node<P, A>>>,
        key: Option<&dyn Fn(&P) -> Ordering>,
        removed: &mut Option<P>,
    ) -> Option<Box<Node<P, A>>> {
        let mut root = root?;

        let cmp = match key {
            Some(k) => k(&root.payload),
            None => {
                if root.lc.is_some() {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            }
        };

        match cmp {
            Ordering::Less => {
                let lc = Self::remove_main(root.lc.take(), key, removed);
                root.lc = lc;
                if removed.is_none() {
                    return Some(root);
                }
            }
            Ordering::Greater => {
                let rc = Self::remove_main(root.rc.take(), key, removed);
                root.rc = rc;
                if removed.is_none() {
                    return Some(root);
                }
            }
            Ordering::Equal => {
                return match (root.lc.take(), root.rc.take()) {
                    (None, None) => {
                        *removed = Some(root.payload);
                        None
                    }
                    (Some(lc), None) => {
                        *removed = Some(root.payload);
                        Some(lc)
                    }
                    (None, Some(rc)) => {
                        *removed = Some(root.payload);
                        Some(rc)
                    }
                    (Some(lc), Some(rc)) => {
                        // Splice in the leftmost payload of the right
                        // subtree, then drop this node.
                        let mut succ = None;
                        let rc = Self::remove_main(Some(rc), None, &mut succ);
                        let succ = succ.expect("right subtree is non-empty");
                        *removed = Some(std::mem::replace(&mut root.payload, succ));
                        root.lc = Some(lc);
                        root.rc = rc;
                        Some(Self::rebalance(root))
                    }
                };
            }
        }

        Some(Self::rebalance(root))
    }

    /// Removes the payload matched by `key`, returning it, or `None` if no
    /// payload matches.
    pub fn remove<F: Fn(&P) -> Ordering>(&mut self, key: F) -> Option<P> {
        let mut removed = None;
        let key: &dyn Fn(&P) -> Ordering = &key;
        self.root = Self::remove_main(self.root.take(), Some(key), &mut removed);
        removed
    }

    /// Removes the payload comparing equal to `probe`, returning it.
    pub fn remove_matching(&mut self, probe: &P) -> Option<P> {
        self.remove(|p| probe.cmp_payload(p))
    }

    /// Annotation-guided descent; see [`crate::avl::AvlDisk::search`].
    pub fn search<F>(&self, mut searcher: F) -> Option<&P>
    where
        F: FnMut(Option<&A>, &P, Option<&A>) -> MemSearchStep,
    {
        let mut node = self.root.as_deref()?;
        loop {
            let step = searcher(
                node.lc.as_ref().map(|n| &n.annotation),
                &node.payload,
                node.rc.as_ref().map(|n| &n.annotation),
            );
            match step {
                MemSearchStep::Left => node = node.lc.as_deref()?,
                MemSearchStep::Right => node = node.rc.as_deref()?,
                MemSearchStep::Stop => return Some(&node.payload),
                MemSearchStep::Abort => return None,
            }
        }
    }

    /// The annotation over the entire tree, if non-empty.
    pub fn root_annotation(&self) -> Option<&A> {
        self.root.as_ref().map(|n| &n.annotation)
    }
}
