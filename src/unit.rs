//! Utilities for working with raw byte units.

use core::fmt;

/// `1 KiB`
pub const KIB: usize = 1 << 10;
/// `1 MiB`
pub const MIB: usize = 1 << 20;
/// `1 GiB`
pub const GIB: usize = 1 << 30;

/// Wrapper around raw byte that pretty-prints
/// them using the [`Display`](core::fmt::Display)
/// implementation.
#[derive(Debug, Clone, Copy)]
pub struct ByteUnit(pub usize);

/// Shorthand for [`ByteUnit`].
pub fn bytes(count: usize) -> ByteUnit {
    ByteUnit(count)
}

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.0 as f32;

        if self.0 < KIB {
            write!(f, "{} B", self.0)
        } else if self.0 < MIB {
            write!(f, "{:.2} KiB", count / KIB as f32)
        } else if self.0 < GIB {
            write!(f, "{:.2} MiB", count / MIB as f32)
        } else {
            write!(f, "{:.2} GiB", count / GIB as f32)
        }
    }
}
