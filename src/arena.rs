// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The append-only byte store underneath every tree in one index.

use crate::coding::DiskRecord;
use std::fs::File;

/// Offset of a record inside an [`Arena`].
///
/// Offset 0 is reserved as the null pointer; the file prefix (magic number
/// and header) is allocated first so that no tree node can ever land there.
pub type Offset = u64;

/// The null arena offset.
pub const NULL_OFF: Offset = 0;

#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "arena read past end of file",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

enum Backing {
    Mem(Vec<u8>),
    File(File),
}

/// Append-only byte store backing every tree in one index.
///
/// Allocation is monotonic and growth never moves existing data, so an
/// offset handed out by [`Arena::alloc`] stays valid for the lifetime of
/// the arena. Records are read and written by value through [`DiskRecord`];
/// no reference into the store survives a subsequent allocation.
pub struct Arena {
    backing: Backing,
    next_offset: Offset,
}

impl Arena {
    /// Creates an arena held entirely in memory.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self {
            backing: Backing::Mem(Vec::new()),
            next_offset: 0,
        }
    }

    /// Creates an arena backed by a (fresh, zero-length) file.
    ///
    /// The caller keeps ownership of the path; this type only performs
    /// positional I/O on the handle.
    #[must_use]
    pub fn new_on_disk(file: File) -> Self {
        Self {
            backing: Backing::File(file),
            next_offset: 0,
        }
    }

    /// Opens an existing file read-only, with allocation positioned at its
    /// end so reads of any stored offset succeed.
    pub fn open_readonly(file: File) -> std::io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            backing: Backing::File(file),
            next_offset: len,
        })
    }

    /// One past the last allocated byte.
    #[must_use]
    pub fn curr_offset(&self) -> Offset {
        self.next_offset
    }

    /// Allocates `size` bytes and returns their offset.
    ///
    /// The new range is zero-filled. File growth goes through `set_len`, so
    /// a crash mid-build leaves a file whose header never gained the
    /// completion flag, which the reader rejects.
    pub fn alloc(&mut self, size: usize) -> std::io::Result<Offset> {
        let offset = self.next_offset;
        let new_end = offset + size as u64;

        match &mut self.backing {
            Backing::Mem(v) => {
                if new_end as usize > v.len() {
                    // Amortise: double rather than growing per allocation.
                    let mut cap = v.len().max(64);
                    while cap < new_end as usize {
                        cap *= 2;
                    }
                    v.resize(cap, 0);
                }
            }
            Backing::File(f) => {
                if new_end > f.metadata()?.len() {
                    f.set_len(new_end.next_power_of_two().max(1 << 16))?;
                }
            }
        }

        self.next_offset = new_end;
        Ok(offset)
    }

    /// Reads raw bytes at `offset` into `buf`.
    pub fn read_bytes(&self, offset: Offset, buf: &mut [u8]) -> std::io::Result<()> {
        debug_assert!(offset + buf.len() as u64 <= self.next_offset);
        match &self.backing {
            Backing::Mem(v) => {
                buf.copy_from_slice(&v[offset as usize..offset as usize + buf.len()]);
                Ok(())
            }
            Backing::File(f) => read_at(f, buf, offset),
        }
    }

    /// Writes raw bytes at `offset`, which must already be allocated.
    pub fn write_bytes(&mut self, offset: Offset, buf: &[u8]) -> std::io::Result<()> {
        debug_assert!(offset + buf.len() as u64 <= self.next_offset);
        match &mut self.backing {
            Backing::Mem(v) => {
                v[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            Backing::File(f) => write_at(f, buf, offset),
        }
    }

    /// Reads a typed record at `offset`.
    pub fn get<T: DiskRecord>(&self, offset: Offset) -> std::io::Result<T> {
        let mut buf = vec![0u8; T::LEN];
        self.read_bytes(offset, &mut buf)?;
        Ok(T::read_from(&buf))
    }

    /// Writes a typed record at `offset`.
    pub fn put<T: DiskRecord>(&mut self, offset: Offset, value: &T) -> std::io::Result<()> {
        let mut buf = vec![0u8; T::LEN];
        value.write_to(&mut buf);
        self.write_bytes(offset, &buf)
    }

    /// Allocates space for a record and writes it, returning its offset.
    pub fn put_new<T: DiskRecord>(&mut self, value: &T) -> std::io::Result<Offset> {
        let offset = self.alloc(T::LEN)?;
        self.put(offset, value)?;
        Ok(offset)
    }

    /// Shrinks the backing file to the allocated length and flushes it.
    ///
    /// Only meaningful for on-disk arenas; a no-op in memory.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if let Backing::File(f) = &mut self.backing {
            f.set_len(self.next_offset)?;
            f.sync_all()?;
        }
        Ok(())
    }
}
