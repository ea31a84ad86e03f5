// SPDX-License-Identifier: CEPL-1.0
//! Opaque resource handles.
//!
//! Handles are plain integers so they can cross the game/renderer boundary
//! unchanged. Zero is the null handle. Model handles with the high bit set
//! address inline brush models by index; they are the bitwise complement of
//! that index, which keeps the encoding identical to the wire format.

pub const INLINE_MASK: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(pub i32);

/// Decoded view of a [`ModelHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelRef {
    Null,
    Asset(i32),
    Inline(u32),
}

impl ModelHandle {
    pub const NULL: ModelHandle = ModelHandle(0);

    pub fn inline(index: u32) -> Self {
        ModelHandle(!(index as i32))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_inline(self) -> bool {
        (self.0 as u32) & INLINE_MASK != 0
    }

    pub fn resolve(self) -> ModelRef {
        if self.is_null() {
            ModelRef::Null
        } else if self.is_inline() {
            ModelRef::Inline(!self.0 as u32)
        } else {
            ModelRef::Asset(self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub i32);

impl ImageHandle {
    pub const NULL: ImageHandle = ImageHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_handles_round_trip_through_the_high_bit() {
        for index in [0u32, 1, 7, 4096] {
            let h = ModelHandle::inline(index);
            assert!(h.is_inline());
            assert!(h.0 < 0);
            assert_eq!(h.resolve(), ModelRef::Inline(index));
        }
    }

    #[test]
    fn asset_and_null_handles() {
        assert_eq!(ModelHandle::NULL.resolve(), ModelRef::Null);
        assert_eq!(ModelHandle(12).resolve(), ModelRef::Asset(12));
        assert!(!ModelHandle(12).is_inline());
    }
}
