// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The register address map.
//!
//! Registers are stored in the index as bytes in a flat "register space",
//! addressed like memory but with type `'r'`. The table below fixes the
//! layout. Classes may deliberately alias each other: `r`/`w` occupy the
//! low half of each `x` slot, `wsp` the low half of `xsp`, and `v`
//! occupies the same lanes as `q`. The `d` and `s` classes overlap the
//! vector bank differently depending on execution state, so their offsets
//! need the current `internal_flags` value.
//!
//! `internal_flags` itself is a fake register the indexer stores alongside
//! the real ones, recording state the trace never shows as a register
//! update (AArch32 vs AArch64, endianness).

use crate::arena::Offset as Addr;

/// Bit in `internal_flags`: currently executing in AArch64 state.
pub const IFLAG_AARCH64: u32 = 1;
/// Bit in `internal_flags`: memory accesses are big-endian.
pub const IFLAG_BIGEND: u32 = 2;

/// Register class prefixes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RegPrefix {
    R,
    W,
    X,
    Wsp,
    Xsp,
    V,
    Q,
    D,
    S,
    Psr,
    Fpscr,
    Fpcr,
    Fpsr,
    Vpr,
    InternalFlags,
}

/// One register: a class plus an index within it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RegisterId {
    pub prefix: RegPrefix,
    pub index: u32,
}

struct RegClass {
    prefix: RegPrefix,
    name: &'static str,
    /// Size of one register in bytes.
    size: usize,
    /// Distance between consecutive registers; 0 means the offsets are
    /// computed from `internal_flags` instead of the table.
    stride: u64,
    count: u32,
    /// Base offset in the register space.
    base: Addr,
}

// Layout, in address order:
//   0   ..248   x0..x30  (r/w alias the low word of each slot)
//   248 ..256   xsp      (wsp aliases its low word)
//   256 ..768   q0..q31  (v aliases; d/s overlap per execution state)
//   768 ..792   psr, fpscr, fpcr, fpsr, vpr, internal_flags
const Q_BASE: Addr = 256;

const REG_CLASSES: &[RegClass] = &[
    RegClass { prefix: RegPrefix::R, name: "r", size: 4, stride: 8, count: 16, base: 0 },
    RegClass { prefix: RegPrefix::W, name: "w", size: 4, stride: 8, count: 31, base: 0 },
    RegClass { prefix: RegPrefix::X, name: "x", size: 8, stride: 8, count: 31, base: 0 },
    RegClass { prefix: RegPrefix::Wsp, name: "wsp", size: 4, stride: 8, count: 1, base: 248 },
    RegClass { prefix: RegPrefix::Xsp, name: "xsp", size: 8, stride: 8, count: 1, base: 248 },
    RegClass { prefix: RegPrefix::V, name: "v", size: 16, stride: 16, count: 32, base: Q_BASE },
    RegClass { prefix: RegPrefix::Q, name: "q", size: 16, stride: 16, count: 32, base: Q_BASE },
    RegClass { prefix: RegPrefix::D, name: "d", size: 8, stride: 0, count: 32, base: Q_BASE },
    RegClass { prefix: RegPrefix::S, name: "s", size: 4, stride: 0, count: 32, base: Q_BASE },
    RegClass { prefix: RegPrefix::Psr, name: "psr", size: 4, stride: 4, count: 1, base: 768 },
    RegClass { prefix: RegPrefix::Fpscr, name: "fpscr", size: 4, stride: 4, count: 1, base: 772 },
    RegClass { prefix: RegPrefix::Fpcr, name: "fpcr", size: 4, stride: 4, count: 1, base: 776 },
    RegClass { prefix: RegPrefix::Fpsr, name: "fpsr", size: 4, stride: 4, count: 1, base: 780 },
    RegClass { prefix: RegPrefix::Vpr, name: "vpr", size: 4, stride: 4, count: 1, base: 784 },
    RegClass { prefix: RegPrefix::InternalFlags, name: "internal_flags", size: 4, stride: 4, count: 1, base: 788 },
];

/// Total extent of the register space in bytes.
pub const REG_SPACE_SIZE: Addr = 792;

/// The `internal_flags` fake register.
pub const REG_IFLAGS: RegisterId = RegisterId { prefix: RegPrefix::InternalFlags, index: 0 };
/// AArch32 stack pointer (r13).
pub const REG_32_SP: RegisterId = RegisterId { prefix: RegPrefix::R, index: 13 };
/// AArch32 link register (r14).
pub const REG_32_LR: RegisterId = RegisterId { prefix: RegPrefix::R, index: 14 };
/// AArch32 first argument register.
pub const REG_32_R0: RegisterId = RegisterId { prefix: RegPrefix::R, index: 0 };
/// AArch32 second argument register.
pub const REG_32_R1: RegisterId = RegisterId { prefix: RegPrefix::R, index: 1 };
/// AArch64 stack pointer.
pub const REG_64_XSP: RegisterId = RegisterId { prefix: RegPrefix::Xsp, index: 0 };
/// AArch64 link register (x30).
pub const REG_64_XLR: RegisterId = RegisterId { prefix: RegPrefix::X, index: 30 };
/// AArch64 first argument register.
pub const REG_64_X0: RegisterId = RegisterId { prefix: RegPrefix::X, index: 0 };
/// AArch64 second argument register.
pub const REG_64_X1: RegisterId = RegisterId { prefix: RegPrefix::X, index: 1 };

fn class_of(prefix: RegPrefix) -> &'static RegClass {
    REG_CLASSES
        .iter()
        .find(|c| c.prefix == prefix)
        .expect("every prefix has a table entry")
}

/// Size of a register in bytes.
#[must_use]
pub fn reg_size(reg: &RegisterId) -> usize {
    class_of(reg.prefix).size
}

/// Whether offsets for this class depend on `internal_flags`.
#[must_use]
pub fn reg_needs_iflags(prefix: RegPrefix) -> bool {
    class_of(prefix).stride == 0
}

/// Byte offset of `reg` in the register space.
///
/// Panics if the class needs `internal_flags` to resolve; check with
/// [`reg_needs_iflags`] or use [`reg_offset_iflags`].
#[must_use]
pub fn reg_offset(reg: &RegisterId) -> Addr {
    assert!(
        !reg_needs_iflags(reg.prefix),
        "register class requires internal_flags for offset lookup"
    );
    let class = class_of(reg.prefix);
    class.base + class.stride * u64::from(reg.index)
}

/// Byte offset of `reg`, resolving state-dependent aliasing from `iflags`.
#[must_use]
pub fn reg_offset_iflags(reg: &RegisterId, iflags: u32) -> Addr {
    let aarch64 = iflags & IFLAG_AARCH64 != 0;
    match reg.prefix {
        // In AArch64, d and s are the low 8/4 bytes of each 16-byte v
        // lane. In AArch32, the d registers pack two per q register and
        // the s registers pack two per d register.
        RegPrefix::D => {
            let stride = if aarch64 { 16 } else { 8 };
            Q_BASE + stride * u64::from(reg.index)
        }
        RegPrefix::S => {
            let stride = if aarch64 { 16 } else { 4 };
            Q_BASE + stride * u64::from(reg.index)
        }
        _ => reg_offset(reg),
    }
}

/// Canonical display name, e.g. `r13`, `xsp`, `psr`.
#[must_use]
pub fn reg_name(reg: &RegisterId) -> String {
    let class = class_of(reg.prefix);
    if class.count == 1 {
        class.name.to_string()
    } else {
        format!("{}{}", class.name, reg.index)
    }
}

/// Resolves a register name from a trace or an expression.
///
/// Case-insensitive. Accepts each class prefix followed by a decimal
/// index, the single-register class names, and the conventional aliases
/// `lr`, `pc` and `cpsr`. The ambiguous bare name `sp` is not resolved
/// here; the parser disambiguates it by data width.
#[must_use]
pub fn lookup_reg_name(name: &str) -> Option<RegisterId> {
    let name = name.to_ascii_lowercase();

    match name.as_str() {
        "lr" => return Some(REG_32_LR),
        "pc" => return Some(RegisterId { prefix: RegPrefix::R, index: 15 }),
        "cpsr" => return Some(RegisterId { prefix: RegPrefix::Psr, index: 0 }),
        _ => {}
    }

    for class in REG_CLASSES {
        if class.count == 1 {
            if name == class.name {
                return Some(RegisterId { prefix: class.prefix, index: 0 });
            }
            continue;
        }
        if let Some(rest) = name.strip_prefix(class.name) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                // "r" would otherwise swallow e.g. "r13x"; the all-digit
                // check plus the index bound keeps lookup exact.
                let index: u32 = rest.parse().ok()?;
                if index < class.count {
                    return Some(RegisterId { prefix: class.prefix, index });
                }
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lookup() {
        assert_eq!(Some(REG_32_R0), lookup_reg_name("r0"));
        assert_eq!(Some(REG_32_SP), lookup_reg_name("r13"));
        assert_eq!(Some(REG_32_LR), lookup_reg_name("LR"));
        assert_eq!(Some(REG_64_XSP), lookup_reg_name("xsp"));
        assert_eq!(Some(REG_64_XLR), lookup_reg_name("x30"));
        assert_eq!(
            Some(RegisterId { prefix: RegPrefix::Psr, index: 0 }),
            lookup_reg_name("cpsr")
        );
        assert_eq!(
            Some(RegisterId { prefix: RegPrefix::D, index: 31 }),
            lookup_reg_name("d31")
        );
        assert_eq!(None, lookup_reg_name("sp"));
        assert_eq!(None, lookup_reg_name("r16"));
        assert_eq!(None, lookup_reg_name("x31"));
        assert_eq!(None, lookup_reg_name("bogus"));
    }

    #[test]
    fn aliased_offsets() {
        // r and w alias the low word of x.
        assert_eq!(
            reg_offset(&RegisterId { prefix: RegPrefix::X, index: 5 }),
            reg_offset(&RegisterId { prefix: RegPrefix::R, index: 5 })
        );
        // wsp aliases xsp, after the x bank.
        assert_eq!(248, reg_offset(&REG_64_XSP));
        assert_eq!(248, reg_offset(&RegisterId { prefix: RegPrefix::Wsp, index: 0 }));
        // v aliases q.
        assert_eq!(
            reg_offset(&RegisterId { prefix: RegPrefix::Q, index: 3 }),
            reg_offset(&RegisterId { prefix: RegPrefix::V, index: 3 })
        );
        assert_eq!(788, reg_offset(&REG_IFLAGS));
    }

    #[test]
    fn state_dependent_offsets() {
        let d7 = RegisterId { prefix: RegPrefix::D, index: 7 };
        let s7 = RegisterId { prefix: RegPrefix::S, index: 7 };

        assert!(reg_needs_iflags(RegPrefix::D));
        assert!(reg_needs_iflags(RegPrefix::S));
        assert!(!reg_needs_iflags(RegPrefix::X));

        // AArch32: s3..s2 pack into d1, d1 packs into q0.
        assert_eq!(256 + 8 * 7, reg_offset_iflags(&d7, 0));
        assert_eq!(256 + 4 * 7, reg_offset_iflags(&s7, 0));

        // AArch64: both sit at the bottom of v7.
        assert_eq!(256 + 16 * 7, reg_offset_iflags(&d7, IFLAG_AARCH64));
        assert_eq!(256 + 16 * 7, reg_offset_iflags(&s7, IFLAG_AARCH64));
    }
}
