// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persistent AVL tree over an [`Arena`].
//!
//! Nodes live at arena offsets; a tree is just a root offset plus a
//! high-water mark. Every node at an offset below the high-water mark is
//! immutable: updating it goes through [`AvlDisk::rewrite`]'s copy path, so
//! any root committed earlier keeps describing exactly the data it described
//! at commit time. Raising the mark with [`AvlDisk::commit`] is what turns
//! "the nodes written since the last commit" into history.
//!
//! Trees never own the arena. Every operation borrows it for the duration
//! of the call, which also guarantees no stale view of the store is held
//! across an allocation.

use crate::arena::{Arena, Offset, NULL_OFF};
use crate::coding::{DiskRecord, FieldReader, FieldWriter};
use std::cmp::Ordering;
use std::io;
use std::marker::PhantomData;

/// Node payload: the record stored in each tree node, with a total order.
///
/// [`AvlDisk::insert`] requires the new payload to compare unequal to every
/// payload already in the tree; callers that need duplicates disambiguate
/// with a tie-breaker field.
pub trait Payload: DiskRecord + Clone {
    fn cmp_payload(&self, other: &Self) -> Ordering;
}

/// Subtree annotation, folded bottom-up over the tree.
///
/// `combine` must be associative with respect to in-order concatenation;
/// [`AvlDisk::rewrite`] recomputes it as
/// `combine(combine(left, from_payload(p)), right)`.
pub trait Annotation<P>: DiskRecord + Clone {
    fn from_payload(payload: &P) -> Self;
    fn combine(lhs: &Self, rhs: &Self) -> Self;
}

/// Annotation for trees that do not need one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoAnnotation;

impl DiskRecord for NoAnnotation {
    const LEN: usize = 0;

    fn write_to(&self, _: &mut [u8]) {}

    fn read_from(_: &[u8]) -> Self {
        Self
    }
}

impl<P> Annotation<P> for NoAnnotation {
    fn from_payload(_: &P) -> Self {
        Self
    }

    fn combine(_: &Self, _: &Self) -> Self {
        Self
    }
}

/// A search key comparable against payloads of type `P`.
pub trait Key<P> {
    fn cmp_key(&self, payload: &P) -> Ordering;
}

impl<P: Payload> Key<P> for P {
    fn cmp_key(&self, payload: &P) -> Ordering {
        self.cmp_payload(payload)
    }
}

/// Direction decision returned by a [`Searcher`](AvlDisk::search) callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchStep {
    Left,
    Right,
    Stop,
    /// Give up: the target is not representable in this tree (for example,
    /// an offset beyond its total weight). Reported as "not found".
    Abort,
}

/// Traversal order for [`AvlDisk::walk`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkOrder {
    Preorder,
    Inorder,
    Postorder,
}

/// A tree node loaded into memory.
///
/// `offset == 0` never occurs here; the null tree is `None` throughout.
#[derive(Clone, Debug)]
pub struct Node<P, A> {
    pub offset: Offset,
    pub lc: Offset,
    pub rc: Offset,
    pub height: u32,
    pub refcount: u32,
    pub payload: P,
    pub annotation: A,
}

// Field positions within an encoded node.
const POS_HEIGHT: u64 = 16;
const POS_REFCOUNT: u64 = 20;
const HDR_LEN: usize = 24;

struct Removed<P> {
    offset: Offset,
    lc: Offset,
    rc: Offset,
    payload: P,
    /// True if the node sat below a shared or immutable ancestor when it
    /// was unlinked, i.e. it must not be mutated in place afterwards.
    frozen: bool,
}

/// Persistent AVL tree handle.
///
/// Holds no tree data itself, only the commit mark and the refcounting
/// mode; several trees routinely share one arena.
pub struct AvlDisk<P, A = NoAnnotation> {
    hwm: Offset,
    refcounted: bool,
    _marker: PhantomData<(P, A)>,
}

impl<P: Payload, A: Annotation<P>> AvlDisk<P, A> {
    const NODE_LEN: usize = HDR_LEN + P::LEN + A::LEN;

    /// Creates a tree whose persistence is driven by [`commit`](Self::commit).
    #[must_use]
    pub fn new(arena: &Arena) -> Self {
        Self {
            hwm: arena.curr_offset(),
            refcounted: false,
            _marker: PhantomData,
        }
    }

    /// Creates a tree that supports [`clone_tree`](Self::clone_tree) and
    /// [`free_tree`](Self::free_tree) via per-node reference counts.
    #[must_use]
    pub fn new_refcounted(arena: &Arena) -> Self {
        Self {
            hwm: arena.curr_offset(),
            refcounted: true,
            _marker: PhantomData,
        }
    }

    /// Opens a tree handle over an already-written arena, read-only in
    /// practice because the mark makes every existing node immutable.
    #[must_use]
    pub fn attach(arena: &Arena) -> Self {
        Self::new(arena)
    }

    /// Makes every node written so far immutable.
    pub fn commit(&mut self, arena: &Arena) {
        self.hwm = arena.curr_offset();
    }

    pub(crate) fn get(&self, arena: &Arena, offset: Offset) -> io::Result<Node<P, A>> {
        debug_assert_ne!(NULL_OFF, offset, "attempted to load the null node");
        let mut buf = vec![0u8; Self::NODE_LEN];
        arena.read_bytes(offset, &mut buf)?;
        let mut r = FieldReader::new(&buf);
        Ok(Node {
            offset,
            lc: r.get(),
            rc: r.get(),
            height: r.get(),
            refcount: r.get(),
            payload: r.get(),
            annotation: r.get(),
        })
    }

    pub(crate) fn put(&self, arena: &mut Arena, n: &Node<P, A>) -> io::Result<()> {
        let mut buf = vec![0u8; Self::NODE_LEN];
        let mut w = FieldWriter::new(&mut buf);
        w.put(&n.lc);
        w.put(&n.rc);
        w.put(&n.height);
        w.put(&n.refcount);
        w.put(&n.payload);
        w.put(&n.annotation);
        arena.write_bytes(n.offset, &buf)
    }

    fn height_of(&self, arena: &Arena, offset: Offset) -> io::Result<u32> {
        if offset == NULL_OFF {
            Ok(0)
        } else {
            arena.get(offset + POS_HEIGHT)
        }
    }

    fn refcount_of(&self, arena: &Arena, offset: Offset) -> io::Result<u32> {
        arena.get(offset + POS_REFCOUNT)
    }

    fn ref_inc(&self, arena: &mut Arena, offset: Offset) -> io::Result<()> {
        if offset != NULL_OFF {
            let rc = self.refcount_of(arena, offset)?;
            arena.put(offset + POS_REFCOUNT, &(rc + 1))?;
        }
        Ok(())
    }

    fn ref_dec(&self, arena: &mut Arena, offset: Offset) -> io::Result<()> {
        if offset != NULL_OFF {
            let rc = self.refcount_of(arena, offset)?;
            debug_assert!(rc > 0, "refcount underflow");
            arena.put(offset + POS_REFCOUNT, &(rc - 1))?;
        }
        Ok(())
    }

    fn immutable(&self, n: &Node<P, A>) -> bool {
        n.offset < self.hwm
    }

    /// The single choke point through which every structural change goes.
    ///
    /// Sets the node's children to `newlc`/`newrc`, recomputing height and
    /// annotation. If the node is immutable, or shared in a refcounted
    /// tree (`frozen` marks sharing anywhere on the path above), the
    /// mutation lands in a freshly allocated node instead and `n.offset`
    /// is updated to point at it.
    fn rewrite(
        &self,
        arena: &mut Arena,
        n: &mut Node<P, A>,
        newlc: Offset,
        newrc: Offset,
        frozen: bool,
    ) -> io::Result<()> {
        if self.refcounted {
            // Sibling rewrites inside a rotation may have adjusted this
            // node's count on disk since it was loaded.
            n.refcount = self.refcount_of(arena, n.offset)?;
        }

        let need_copy =
            self.immutable(n) || (self.refcounted && (frozen || n.refcount > 1));

        if need_copy {
            if self.refcounted {
                // The copy adds one incoming link to each child; the old
                // node keeps its own links and its own refcount.
                self.ref_inc(arena, newlc)?;
                self.ref_inc(arena, newrc)?;
            }
            n.offset = arena.alloc(Self::NODE_LEN)?;
            n.refcount = if self.refcounted { 0 } else { 1 };
        } else if self.refcounted {
            if n.lc != newlc {
                self.ref_dec(arena, n.lc)?;
                self.ref_inc(arena, newlc)?;
            }
            if n.rc != newrc {
                self.ref_dec(arena, n.rc)?;
                self.ref_inc(arena, newrc)?;
            }
        }

        n.lc = newlc;
        n.rc = newrc;
        n.height = self
            .height_of(arena, newlc)?
            .max(self.height_of(arena, newrc)?)
            + 1;

        n.annotation = A::from_payload(&n.payload);
        if n.lc != NULL_OFF {
            let lc = self.get(arena, n.lc)?;
            n.annotation = A::combine(&lc.annotation, &n.annotation);
        }
        if n.rc != NULL_OFF {
            let rc = self.get(arena, n.rc)?;
            n.annotation = A::combine(&n.annotation, &rc.annotation);
        }

        self.put(arena, n)
    }

    fn rotate_left(
        &self,
        arena: &mut Arena,
        n: &mut Node<P, A>,
        frozen: bool,
    ) -> io::Result<Node<P, A>> {
        let n_shared = self.refcounted && self.refcount_of(arena, n.offset)? > 1;
        let mut rc = self.get(arena, n.rc)?;
        let (t0, t1, t2) = (n.lc, rc.lc, rc.rc);
        self.rewrite(arena, n, t0, t1, frozen)?;
        self.rewrite(arena, &mut rc, n.offset, t2, frozen || n_shared)?;
        Ok(rc)
    }

    fn rotate_right(
        &self,
        arena: &mut Arena,
        n: &mut Node<P, A>,
        frozen: bool,
    ) -> io::Result<Node<P, A>> {
        let n_shared = self.refcounted && self.refcount_of(arena, n.offset)? > 1;
        let mut lc = self.get(arena, n.lc)?;
        let (t0, t1, t2) = (lc.lc, lc.rc, n.rc);
        self.rewrite(arena, n, t1, t2, frozen)?;
        self.rewrite(arena, &mut lc, t0, n.offset, frozen || n_shared)?;
        Ok(lc)
    }

    fn child_frozen(&self, frozen: bool, parent: &Node<P, A>) -> bool {
        frozen || (self.refcounted && parent.refcount > 1)
    }

    fn insert_main(
        &self,
        arena: &mut Arena,
        mut root: Node<P, A>,
        n: Node<P, A>,
        frozen: bool,
    ) -> io::Result<Node<P, A>> {
        let cmp = root.payload.cmp_payload(&n.payload);
        assert_ne!(
            Ordering::Equal,
            cmp,
            "insert: payload compares equal to an existing payload"
        );

        let down = self.child_frozen(frozen, &root);

        if cmp == Ordering::Greater {
            let lc = if root.lc == NULL_OFF {
                n
            } else {
                let lc = self.get(arena, root.lc)?;
                self.insert_main(arena, lc, n, down)?
            };
            let rc_off = root.rc;
            self.rewrite(arena, &mut root, lc.offset, rc_off, frozen)?;

            let k = self.height_of(arena, root.rc)?;
            if lc.height == k + 2 {
                let mut lc = lc;
                if self.height_of(arena, lc.rc)? == k + 1 {
                    lc = self.rotate_left(arena, &mut lc, down)?;
                    let rc_off = root.rc;
                    self.rewrite(arena, &mut root, lc.offset, rc_off, frozen)?;
                }
                return self.rotate_right(arena, &mut root, frozen);
            }
        } else {
            let rc = if root.rc == NULL_OFF {
                n
            } else {
                let rc = self.get(arena, root.rc)?;
                self.insert_main(arena, rc, n, down)?
            };
            let lc_off = root.lc;
            self.rewrite(arena, &mut root, lc_off, rc.offset, frozen)?;

            let k = self.height_of(arena, root.lc)?;
            if rc.height == k + 2 {
                let mut rc = rc;
                if self.height_of(arena, rc.lc)? == k + 1 {
                    rc = self.rotate_right(arena, &mut rc, down)?;
                    let lc_off = root.lc;
                    self.rewrite(arena, &mut root, lc_off, rc.offset, frozen)?;
                }
                return self.rotate_left(arena, &mut root, frozen);
            }
        }

        Ok(root)
    }

    /// Inserts `payload`, returning the new root offset.
    ///
    /// Panics if an equal payload is already present.
    pub fn insert(
        &self,
        arena: &mut Arena,
        oldroot: Offset,
        payload: P,
    ) -> io::Result<Offset> {
        let n = Node {
            offset: arena.alloc(Self::NODE_LEN)?,
            lc: NULL_OFF,
            rc: NULL_OFF,
            height: 1,
            refcount: if self.refcounted { 0 } else { 1 },
            annotation: A::from_payload(&payload),
            payload,
        };
        self.put(arena, &n)?;

        let root = if oldroot == NULL_OFF {
            n
        } else {
            let root = self.get(arena, oldroot)?;
            self.insert_main(arena, root, n, false)?
        };

        if self.refcounted && root.offset != oldroot {
            self.ref_inc(arena, root.offset)?;
            self.ref_dec(arena, oldroot)?;
        }

        Ok(root.offset)
    }

    #[allow(clippy::too_many_lines)]
    fn remove_main<K: Key<P> + ?Sized>(
        &self,
        arena: &mut Arena,
        mut root: Node<P, A>,
        keyfinder: Option<&K>,
        frozen: bool,
        removed: &mut Option<Removed<P>>,
    ) -> io::Result<Option<Node<P, A>>> {
        let cmp = match keyfinder {
            Some(k) => k.cmp_key(&root.payload),
            // No key: unlink the leftmost node (successor extraction).
            None => {
                if root.lc != NULL_OFF {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            }
        };

        let down = self.child_frozen(frozen, &root);

        if cmp == Ordering::Less {
            if root.lc == NULL_OFF {
                return Ok(Some(root)); // not found
            }
            let lc = self.get(arena, root.lc)?;
            let lc = self.remove_main(arena, lc, keyfinder, down, removed)?;
            if removed.is_none() {
                return Ok(Some(root));
            }
            let lc_off = lc.as_ref().map_or(NULL_OFF, |n| n.offset);
            let rc_off = root.rc;
            self.rewrite(arena, &mut root, lc_off, rc_off, frozen)?;

            let k = self.height_of(arena, root.lc)?;
            if self.height_of(arena, root.rc)? == k + 2 {
                let mut rc = self.get(arena, root.rc)?;
                if self.height_of(arena, rc.lc)? == k + 1 {
                    let rc2 = self.rotate_right(arena, &mut rc, down)?;
                    let lc_off = root.lc;
                    self.rewrite(arena, &mut root, lc_off, rc2.offset, frozen)?;
                }
                return Ok(Some(self.rotate_left(arena, &mut root, frozen)?));
            }
        } else if cmp == Ordering::Greater {
            if root.rc == NULL_OFF {
                return Ok(Some(root)); // not found
            }
            let rc = self.get(arena, root.rc)?;
            let rc = self.remove_main(arena, rc, keyfinder, down, removed)?;
            if removed.is_none() {
                return Ok(Some(root));
            }
            let rc_off = rc.as_ref().map_or(NULL_OFF, |n| n.offset);
            let lc_off = root.lc;
            self.rewrite(arena, &mut root, lc_off, rc_off, frozen)?;

            let k = self.height_of(arena, root.rc)?;
            if self.height_of(arena, root.lc)? == k + 2 {
                let mut lc = self.get(arena, root.lc)?;
                if self.height_of(arena, lc.rc)? == k + 1 {
                    let lc2 = self.rotate_left(arena, &mut lc, down)?;
                    let rc_off = root.rc;
                    self.rewrite(arena, &mut root, lc2.offset, rc_off, frozen)?;
                }
                return Ok(Some(self.rotate_right(arena, &mut root, frozen)?));
            }
        } else {
            *removed = Some(Removed {
                offset: root.offset,
                lc: root.lc,
                rc: root.rc,
                payload: root.payload.clone(),
                frozen: frozen || (self.refcounted && root.refcount > 1),
            });

            if root.lc == NULL_OFF && root.rc == NULL_OFF {
                return Ok(None);
            } else if root.lc == NULL_OFF {
                return Ok(Some(self.get(arena, root.rc)?));
            } else if root.rc == NULL_OFF {
                return Ok(Some(self.get(arena, root.lc)?));
            }

            // Interior node: splice in the leftmost node of the right
            // subtree. The successor is unlinked by the recursion, then
            // takes over this node's children.
            let rc = self.get(arena, root.rc)?;
            let mut succ_removed = None;
            let rc = self.remove_main::<K>(arena, rc, None, down, &mut succ_removed)?;
            let succ = succ_removed.expect("right subtree is non-empty");

            let mut new_root = Node {
                offset: succ.offset,
                lc: succ.lc,
                rc: succ.rc,
                height: 0,
                refcount: self.refcount_of(arena, succ.offset)?,
                annotation: A::from_payload(&succ.payload),
                payload: succ.payload,
            };
            let rc_off = rc.as_ref().map_or(NULL_OFF, |n| n.offset);
            let lc_off = root.lc;
            self.rewrite(arena, &mut new_root, lc_off, rc_off, succ.frozen)?;

            let k = self.height_of(arena, new_root.rc)?;
            if self.height_of(arena, new_root.lc)? == k + 2 {
                let mut lc = self.get(arena, new_root.lc)?;
                if self.height_of(arena, lc.rc)? == k + 1 {
                    let lc2 = self.rotate_left(arena, &mut lc, down)?;
                    let rc_off = new_root.rc;
                    self.rewrite(arena, &mut new_root, lc2.offset, rc_off, succ.frozen)?;
                }
                return Ok(Some(self.rotate_right(arena, &mut new_root, succ.frozen)?));
            }

            return Ok(Some(new_root));
        }

        Ok(Some(root))
    }

    /// Removes the payload matching `key`, returning the new root and the
    /// removed payload. A missing key is a no-op returning `None`.
    pub fn remove<K: Key<P> + ?Sized>(
        &self,
        arena: &mut Arena,
        oldroot: Offset,
        key: &K,
    ) -> io::Result<(Offset, Option<P>)> {
        if oldroot == NULL_OFF {
            return Ok((NULL_OFF, None));
        }

        let root = self.get(arena, oldroot)?;
        let mut removed = None;
        let newroot = self.remove_main(arena, root, Some(key), false, &mut removed)?;
        let newroot_off = newroot.map_or(NULL_OFF, |n| n.offset);

        let Some(r) = removed else {
            return Ok((oldroot, None));
        };

        if self.refcounted {
            if newroot_off != oldroot {
                self.ref_inc(arena, newroot_off)?;
                self.ref_dec(arena, oldroot)?;
            }
            // If the unlinked node is now dead, its links to its former
            // children die with it. (The children themselves were spliced
            // back into the tree, so they cannot reach zero here.)
            if self.refcount_of(arena, r.offset)? == 0 {
                self.ref_dec(arena, r.lc)?;
                self.ref_dec(arena, r.rc)?;
            }
        }

        Ok((newroot_off, Some(r.payload)))
    }

    /// Registers another root handle on `root`, sharing all nodes.
    pub fn clone_tree(&self, arena: &mut Arena, root: Offset) -> io::Result<Offset> {
        assert!(self.refcounted, "clone_tree on a non-refcounted tree");
        self.ref_inc(arena, root)?;
        Ok(root)
    }

    /// Drops a root handle, releasing every node that becomes unreachable.
    pub fn free_tree(&self, arena: &mut Arena, root: Offset) -> io::Result<()> {
        assert!(self.refcounted, "free_tree on a non-refcounted tree");
        if root == NULL_OFF {
            return Ok(());
        }
        let rc = self.refcount_of(arena, root)?;
        debug_assert!(rc > 0, "refcount underflow");
        arena.put(root + POS_REFCOUNT, &(rc - 1))?;
        if rc == 1 {
            let n = self.get(arena, root)?;
            self.free_tree(arena, n.lc)?;
            self.free_tree(arena, n.rc)?;
        }
        Ok(())
    }

    fn find_main<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        offset: Offset,
        key: &K,
    ) -> io::Result<Option<Node<P, A>>> {
        if offset == NULL_OFF {
            return Ok(None);
        }
        let n = self.get(arena, offset)?;
        match key.cmp_key(&n.payload) {
            Ordering::Equal => Ok(Some(n)),
            Ordering::Less => self.find_main(arena, n.lc, key),
            Ordering::Greater => self.find_main(arena, n.rc, key),
        }
    }

    /// Finds any payload comparing equal to `key`.
    pub fn find<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        root: Offset,
        key: &K,
    ) -> io::Result<Option<(P, Offset)>> {
        Ok(self
            .find_main(arena, root, key)?
            .map(|n| (n.payload, n.offset)))
    }

    fn find_extreme_main<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        offset: Offset,
        key: &K,
        leftmost: bool,
    ) -> io::Result<Option<Node<P, A>>> {
        if offset == NULL_OFF {
            return Ok(None);
        }
        let n = self.get(arena, offset)?;
        match key.cmp_key(&n.payload) {
            Ordering::Equal => {
                let further = if leftmost { n.lc } else { n.rc };
                Ok(Some(
                    self.find_extreme_main(arena, further, key, leftmost)?
                        .unwrap_or(n),
                ))
            }
            Ordering::Less => self.find_extreme_main(arena, n.lc, key, leftmost),
            Ordering::Greater => self.find_extreme_main(arena, n.rc, key, leftmost),
        }
    }

    /// Finds the in-order first payload comparing equal to `key`.
    pub fn find_leftmost<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        root: Offset,
        key: &K,
    ) -> io::Result<Option<(P, Offset)>> {
        Ok(self
            .find_extreme_main(arena, root, key, true)?
            .map(|n| (n.payload, n.offset)))
    }

    /// Finds the in-order last payload comparing equal to `key`.
    pub fn find_rightmost<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        root: Offset,
        key: &K,
    ) -> io::Result<Option<(P, Offset)>> {
        Ok(self
            .find_extreme_main(arena, root, key, false)?
            .map(|n| (n.payload, n.offset)))
    }

    fn predsucc_main<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        offset: Offset,
        key: &K,
        sign: Ordering,
    ) -> io::Result<Option<Node<P, A>>> {
        if offset == NULL_OFF {
            return Ok(None);
        }
        let n = self.get(arena, offset)?;
        let mut cmp = key.cmp_key(&n.payload);
        if cmp == Ordering::Equal {
            // The matching element itself is excluded; pretend it was just
            // too small (successor) or too big (predecessor).
            cmp = sign;
        }

        if cmp == Ordering::Less {
            let ret = self.predsucc_main(arena, n.lc, key, sign)?;
            if sign == Ordering::Greater {
                Ok(Some(ret.unwrap_or(n)))
            } else {
                Ok(ret)
            }
        } else {
            let ret = self.predsucc_main(arena, n.rc, key, sign)?;
            if sign == Ordering::Less {
                Ok(Some(ret.unwrap_or(n)))
            } else {
                Ok(ret)
            }
        }
    }

    /// Strict successor: the smallest payload comparing greater than `key`.
    pub fn succ<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        root: Offset,
        key: &K,
    ) -> io::Result<Option<(P, Offset)>> {
        Ok(self
            .predsucc_main(arena, root, key, Ordering::Greater)?
            .map(|n| (n.payload, n.offset)))
    }

    /// Strict predecessor: the largest payload comparing less than `key`.
    pub fn pred<K: Key<P> + ?Sized>(
        &self,
        arena: &Arena,
        root: Offset,
        key: &K,
    ) -> io::Result<Option<(P, Offset)>> {
        Ok(self
            .predsucc_main(arena, root, key, Ordering::Less)?
            .map(|n| (n.payload, n.offset)))
    }

    /// The in-order smallest payload.
    pub fn first(&self, arena: &Arena, root: Offset) -> io::Result<Option<(P, Offset)>> {
        let mut offset = root;
        let mut best = None;
        while offset != NULL_OFF {
            let n = self.get(arena, offset)?;
            offset = n.lc;
            best = Some((n.payload, n.offset));
        }
        Ok(best)
    }

    /// The in-order largest payload.
    pub fn last(&self, arena: &Arena, root: Offset) -> io::Result<Option<(P, Offset)>> {
        let mut offset = root;
        let mut best = None;
        while offset != NULL_OFF {
            let n = self.get(arena, offset)?;
            offset = n.rc;
            best = Some((n.payload, n.offset));
        }
        Ok(best)
    }

    /// General tri-valued descent.
    ///
    /// At each node, the searcher is shown the left child's offset and
    /// annotation (if any), the node itself, and the right child's offset
    /// and annotation, and steers the descent. This is what rank/select
    /// style queries build on.
    pub fn search<F>(
        &self,
        arena: &Arena,
        root: Offset,
        mut searcher: F,
    ) -> io::Result<Option<P>>
    where
        F: FnMut(Offset, Option<&A>, Offset, &P, &A, Offset, Option<&A>) -> SearchStep,
    {
        let mut offset = root;
        while offset != NULL_OFF {
            let n = self.get(arena, offset)?;
            let lca = if n.lc != NULL_OFF {
                Some(self.get(arena, n.lc)?.annotation)
            } else {
                None
            };
            let rca = if n.rc != NULL_OFF {
                Some(self.get(arena, n.rc)?.annotation)
            } else {
                None
            };

            match searcher(
                n.lc,
                lca.as_ref(),
                offset,
                &n.payload,
                &n.annotation,
                n.rc,
                rca.as_ref(),
            ) {
                SearchStep::Left => offset = n.lc,
                SearchStep::Right => offset = n.rc,
                SearchStep::Stop => return Ok(Some(n.payload)),
                SearchStep::Abort => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Read-only traversal in the given order.
    pub fn walk<F>(
        &self,
        arena: &Arena,
        root: Offset,
        order: WalkOrder,
        visitor: &mut F,
    ) -> io::Result<()>
    where
        F: FnMut(&P, &A, Offset),
    {
        if root == NULL_OFF {
            return Ok(());
        }
        let n = self.get(arena, root)?;

        if order == WalkOrder::Preorder {
            visitor(&n.payload, &n.annotation, root);
        }
        self.walk(arena, n.lc, order, visitor)?;
        if order == WalkOrder::Inorder {
            visitor(&n.payload, &n.annotation, root);
        }
        self.walk(arena, n.rc, order, visitor)?;
        if order == WalkOrder::Postorder {
            visitor(&n.payload, &n.annotation, root);
        }
        Ok(())
    }

    /// Loads a node for callers that need raw structure access (the
    /// indexer's post-passes rewrite payloads and annotations in place).
    pub(crate) fn node(&self, arena: &Arena, offset: Offset) -> io::Result<Node<P, A>> {
        self.get(arena, offset)
    }

    /// Writes back a node loaded with [`node`](Self::node).
    pub(crate) fn update_node(
        &self,
        arena: &mut Arena,
        n: &Node<P, A>,
    ) -> io::Result<()> {
        self.put(arena, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct TestPayload(u32);

    impl DiskRecord for TestPayload {
        const LEN: usize = 4;

        fn write_to(&self, buf: &mut [u8]) {
            self.0.write_to(buf);
        }

        fn read_from(buf: &[u8]) -> Self {
            Self(u32::read_from(buf))
        }
    }

    impl Payload for TestPayload {
        fn cmp_payload(&self, other: &Self) -> Ordering {
            self.0.cmp(&other.0)
        }
    }

    /// Counts payloads per subtree; lets the tests validate annotation
    /// recomputation through every rotation.
    #[derive(Clone, Debug, Eq, PartialEq)]
    struct CountAnnotation(u32);

    impl DiskRecord for CountAnnotation {
        const LEN: usize = 4;

        fn write_to(&self, buf: &mut [u8]) {
            self.0.write_to(buf);
        }

        fn read_from(buf: &[u8]) -> Self {
            Self(u32::read_from(buf))
        }
    }

    impl Annotation<TestPayload> for CountAnnotation {
        fn from_payload(_: &TestPayload) -> Self {
            Self(1)
        }

        fn combine(lhs: &Self, rhs: &Self) -> Self {
            Self(lhs.0 + rhs.0)
        }
    }

    type Tree = AvlDisk<TestPayload, CountAnnotation>;

    fn new_arena() -> Arena {
        let mut arena = Arena::new_in_memory();
        arena.alloc(16).unwrap(); // keep offset 0 unused
        arena
    }

    fn check_structure(tree: &Tree, arena: &Arena, root: Offset) -> (u32, u32, Option<u32>, Option<u32>) {
        // Returns (height, count, min, max) and asserts AVL shape,
        // ordering and annotation along the way.
        if root == NULL_OFF {
            return (0, 0, None, None);
        }
        let n = tree.get(arena, root).unwrap();
        let (lh, lcount, lmin, lmax) = check_structure(tree, arena, n.lc);
        let (rh, rcount, rmin, rmax) = check_structure(tree, arena, n.rc);

        assert!(lh.abs_diff(rh) <= 1, "AVL imbalance at {root}");
        assert_eq!(lh.max(rh) + 1, n.height, "bad height at {root}");
        assert_eq!(lcount + rcount + 1, n.annotation.0, "bad annotation at {root}");
        if let Some(lmax) = lmax {
            assert!(lmax < n.payload.0, "order violation at {root}");
        }
        if let Some(rmin) = rmin {
            assert!(rmin > n.payload.0, "order violation at {root}");
        }

        (
            n.height,
            n.annotation.0,
            Some(lmin.unwrap_or(n.payload.0)),
            Some(rmax.unwrap_or(n.payload.0)),
        )
    }

    fn check_refcounts(tree: &Tree, arena: &Arena, roots: &[Offset]) {
        fn visit(
            tree: &Tree,
            arena: &Arena,
            offset: Offset,
            expected: &mut BTreeMap<Offset, u32>,
        ) {
            if offset == NULL_OFF {
                return;
            }
            let count = expected.entry(offset).or_insert(0);
            *count += 1;
            if *count == 1 {
                let n = tree.get(arena, offset).unwrap();
                visit(tree, arena, n.lc, expected);
                visit(tree, arena, n.rc, expected);
            }
        }

        let mut expected = BTreeMap::new();
        for &root in roots {
            visit(tree, arena, root, &mut expected);
        }
        for (&offset, &want) in &expected {
            let n = tree.get(arena, offset).unwrap();
            assert_eq!(
                want, n.refcount,
                "node at {offset} should have refcount {want}, has {}",
                n.refcount
            );
        }
    }

    #[test]
    fn insert_remove_in_modular_orders() {
        let mut arena = new_arena();
        let tree = Tree::new(&arena);
        let p = 1009u32;

        let mut root = NULL_OFF;
        for i in 1..p {
            root = tree.insert(&mut arena, root, TestPayload((i * 123) % p)).unwrap();
        }
        check_structure(&tree, &arena, root);
        assert_eq!(p - 1, tree.get(&arena, root).unwrap().annotation.0);

        for i in 1..p {
            let j = (i * 456) % p;
            let (newroot, removed) = tree.remove(&mut arena, root, &TestPayload(j)).unwrap();
            root = newroot;
            assert_eq!(Some(TestPayload(j)), removed);
        }
        assert_eq!(NULL_OFF, root);

        for i in 1..p {
            root = tree.insert(&mut arena, root, TestPayload((i * 789) % p)).unwrap();
        }
        check_structure(&tree, &arena, root);
    }

    #[test]
    fn randomised_insert_remove_interleaving() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x7A23_11ED);
        let mut arena = new_arena();
        let tree = Tree::new(&arena);

        let mut values: Vec<u32> = (0..600).collect();
        values.shuffle(&mut rng);

        let mut root = NULL_OFF;
        for &v in &values {
            root = tree.insert(&mut arena, root, TestPayload(v)).unwrap();
        }
        check_structure(&tree, &arena, root);

        values.shuffle(&mut rng);
        for &v in values.iter().take(300) {
            let (newroot, removed) = tree.remove(&mut arena, root, &TestPayload(v)).unwrap();
            root = newroot;
            assert_eq!(Some(TestPayload(v)), removed);
        }
        check_structure(&tree, &arena, root);

        for &v in values.iter().take(300) {
            assert!(tree.find(&arena, root, &TestPayload(v)).unwrap().is_none());
        }
        for &v in values.iter().skip(300) {
            assert!(tree.find(&arena, root, &TestPayload(v)).unwrap().is_some());
        }
    }

    #[test]
    fn remove_missing_is_a_noop() {
        let mut arena = new_arena();
        let tree = Tree::new(&arena);

        let mut root = NULL_OFF;
        for i in [5u32, 3, 8, 1] {
            root = tree.insert(&mut arena, root, TestPayload(i)).unwrap();
        }

        let before = arena.curr_offset();
        let (newroot, removed) = tree.remove(&mut arena, root, &TestPayload(99)).unwrap();
        assert_eq!(root, newroot);
        assert_eq!(None, removed);
        assert_eq!(before, arena.curr_offset(), "no-op remove must not allocate");
    }

    #[test]
    fn find_variants_and_neighbours() {
        let mut arena = new_arena();
        let tree = Tree::new(&arena);

        let mut root = NULL_OFF;
        for i in (0..100u32).map(|i| i * 2) {
            root = tree.insert(&mut arena, root, TestPayload(i)).unwrap();
        }

        assert_eq!(
            Some(TestPayload(42)),
            tree.find(&arena, root, &TestPayload(42)).unwrap().map(|x| x.0)
        );
        assert!(tree.find(&arena, root, &TestPayload(43)).unwrap().is_none());

        assert_eq!(
            Some(TestPayload(44)),
            tree.succ(&arena, root, &TestPayload(42)).unwrap().map(|x| x.0)
        );
        assert_eq!(
            Some(TestPayload(44)),
            tree.succ(&arena, root, &TestPayload(43)).unwrap().map(|x| x.0)
        );
        assert_eq!(
            Some(TestPayload(40)),
            tree.pred(&arena, root, &TestPayload(42)).unwrap().map(|x| x.0)
        );
        assert!(tree.pred(&arena, root, &TestPayload(0)).unwrap().is_none());
        assert!(tree.succ(&arena, root, &TestPayload(198)).unwrap().is_none());

        assert_eq!(Some(TestPayload(0)), tree.first(&arena, root).unwrap().map(|x| x.0));
        assert_eq!(Some(TestPayload(198)), tree.last(&arena, root).unwrap().map(|x| x.0));
    }

    #[test]
    fn commit_preserves_old_roots() {
        let mut arena = new_arena();
        let mut tree = Tree::new(&arena);

        let mut root = NULL_OFF;
        for i in 0..200u32 {
            root = tree.insert(&mut arena, root, TestPayload(i)).unwrap();
        }
        let committed_root = root;
        tree.commit(&arena);

        let mut inorder_before = Vec::new();
        tree.walk(&arena, committed_root, WalkOrder::Inorder, &mut |p, _, _| {
            inorder_before.push(p.0);
        })
        .unwrap();

        // Mutate away from the committed root.
        for i in 200..300u32 {
            root = tree.insert(&mut arena, root, TestPayload(i)).unwrap();
        }
        for i in 0..50u32 {
            root = tree.remove(&mut arena, root, &TestPayload(i)).unwrap().0;
        }
        check_structure(&tree, &arena, root);

        let mut inorder_after = Vec::new();
        tree.walk(&arena, committed_root, WalkOrder::Inorder, &mut |p, _, _| {
            inorder_after.push(p.0);
        })
        .unwrap();
        assert_eq!(inorder_before, inorder_after);
    }

    #[test]
    fn clone_and_free_keep_refcounts_exact() {
        let mut arena = new_arena();
        let tree = Tree::new_refcounted(&arena);

        let mut root_a = NULL_OFF;
        for n in (1..=45u32).step_by(2) {
            for i in (1..=n).step_by(2) {
                root_a = tree.insert(&mut arena, root_a, TestPayload(i)).unwrap();
            }
            check_refcounts(&tree, &arena, &[root_a]);

            for i in 0..=n + 1 {
                let root_b = tree.clone_tree(&mut arena, root_a).unwrap();
                check_refcounts(&tree, &arena, &[root_a, root_b]);

                let root_b = if i % 2 == 0 {
                    tree.insert(&mut arena, root_b, TestPayload(i)).unwrap()
                } else {
                    let (newroot, removed) =
                        tree.remove(&mut arena, root_b, &TestPayload(i)).unwrap();
                    assert_eq!(Some(TestPayload(i)), removed);
                    newroot
                };
                check_structure(&tree, &arena, root_a);
                check_structure(&tree, &arena, root_b);
                check_refcounts(&tree, &arena, &[root_a, root_b]);
                tree.free_tree(&mut arena, root_b).unwrap();
                check_refcounts(&tree, &arena, &[root_a]);
            }

            tree.free_tree(&mut arena, root_a).unwrap();
            root_a = NULL_OFF;
        }
    }

    #[test]
    fn clone_isolation() {
        let mut arena = new_arena();
        let tree = Tree::new_refcounted(&arena);

        let mut root_a = NULL_OFF;
        for i in 0..64u32 {
            root_a = tree.insert(&mut arena, root_a, TestPayload(i)).unwrap();
        }

        let root_b = tree.clone_tree(&mut arena, root_a).unwrap();
        let (root_b, removed) = tree.remove(&mut arena, root_b, &TestPayload(31)).unwrap();
        assert_eq!(Some(TestPayload(31)), removed);
        let root_b = tree.insert(&mut arena, root_b, TestPayload(1000)).unwrap();

        // The original root still sees the untouched contents.
        let mut a_contents = Vec::new();
        tree.walk(&arena, root_a, WalkOrder::Inorder, &mut |p, _, _| {
            a_contents.push(p.0);
        })
        .unwrap();
        assert_eq!((0..64).collect::<Vec<_>>(), a_contents);

        assert!(tree.find(&arena, root_b, &TestPayload(31)).unwrap().is_none());
        assert!(tree.find(&arena, root_b, &TestPayload(1000)).unwrap().is_some());
        check_refcounts(&tree, &arena, &[root_a, root_b]);
    }

    #[test]
    fn annotated_rank_search() {
        let mut arena = new_arena();
        let tree = Tree::new(&arena);

        let mut root = NULL_OFF;
        for i in 0..500u32 {
            root = tree.insert(&mut arena, root, TestPayload(i * 10)).unwrap();
        }

        // Select the k-th smallest by annotation-guided descent.
        for k in [0u32, 1, 17, 250, 499] {
            let mut target = k;
            let found = tree
                .search(&arena, root, |_, lca, _, _, _, _, _| {
                    let left = lca.map_or(0, |a| a.0);
                    if target < left {
                        SearchStep::Left
                    } else if target == left {
                        SearchStep::Stop
                    } else {
                        target -= left + 1;
                        SearchStep::Right
                    }
                })
                .unwrap();
            assert_eq!(Some(TestPayload(k * 10)), found);
        }
    }
}
