// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime values and bit-packed addresses.
//!
//! A [`Value`] is a 64-bit payload whose interpretation is chosen by the
//! instruction operating on it; values are not self-describing. The possible
//! views are unsigned/signed integers, a memory [`Address`], and a
//! [`FunctionAddress`].

use core::fmt;

/// A 64-bit runtime value.
///
/// The view is selected by the accessor; storing an address and reading it
/// back as an integer is well-defined (it yields the packed representation).
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Value(u64);

impl Value {
    /// A value with all bits zero.
    pub const ZERO: Self = Self(0);

    /// Creates a value from an unsigned integer.
    #[must_use]
    pub const fn from_uint(v: u64) -> Self {
        Self(v)
    }

    /// Creates a value from a signed integer.
    #[must_use]
    pub const fn from_sint(v: i64) -> Self {
        Self(v as u64)
    }

    /// Creates a value from a memory address.
    #[must_use]
    pub const fn from_address(addr: Address) -> Self {
        Self(addr.pack())
    }

    /// Creates a value from a function address.
    #[must_use]
    pub const fn from_function_address(addr: FunctionAddress) -> Self {
        Self(addr.pack())
    }

    /// Reads the value as an unsigned integer.
    #[must_use]
    pub const fn as_uint(self) -> u64 {
        self.0
    }

    /// Reads the value as a signed integer.
    #[must_use]
    pub const fn as_sint(self) -> i64 {
        self.0 as i64
    }

    /// Reads the value as a memory address.
    #[must_use]
    pub const fn as_address(self) -> Address {
        Address::unpack(self.0)
    }

    /// Reads the value as a function address.
    #[must_use]
    pub const fn as_function_address(self) -> FunctionAddress {
        FunctionAddress::unpack(self.0)
    }

    /// Returns the raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:#x})", self.0)
    }
}

/// A bit-packed logical memory address.
///
/// The packed layout places the allocation index in the low 30 bits, the
/// generation in bits 30..32 and the byte offset in the high 32 bits. The
/// order is chosen so that treating a packed address as an integer and
/// incrementing it changes the allocation index first, which makes
/// arithmetic-on-address bugs fail validation as early as possible.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Address {
    /// Allocation index (30 bits are significant).
    pub allocation: u32,
    /// Generation tag (2 bits are significant).
    pub generation: u8,
    /// Byte offset within the allocation.
    pub offset: u32,
}

impl Address {
    /// The all-ones pattern reserved for the null address.
    pub const NULL: Self = Self::unpack(u64::MAX);

    /// Number of significant allocation-index bits.
    pub const ALLOCATION_BITS: u32 = 30;
    /// Number of significant generation bits.
    pub const GENERATION_BITS: u32 = 2;

    /// Creates an address with offset 0.
    #[must_use]
    pub const fn new(allocation: u32, generation: u8) -> Self {
        Self {
            allocation,
            generation,
            offset: 0,
        }
    }

    /// Packs the address into its 64-bit representation.
    #[must_use]
    pub const fn pack(self) -> u64 {
        let allocation = (self.allocation as u64) & 0x3fff_ffff;
        let generation = (self.generation as u64) & 0b11;
        allocation | (generation << 30) | ((self.offset as u64) << 32)
    }

    /// Unpacks an address from its 64-bit representation.
    #[must_use]
    pub const fn unpack(bits: u64) -> Self {
        Self {
            allocation: (bits & 0x3fff_ffff) as u32,
            generation: ((bits >> 30) & 0b11) as u8,
            offset: (bits >> 32) as u32,
        }
    }

    /// Returns `true` if this is the reserved null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.pack() == u64::MAX
    }

    /// Returns the address with `delta` added to the byte offset, wrapping.
    ///
    /// The wrap stays within the offset field, matching integer arithmetic on
    /// the packed representation's high bits.
    #[must_use]
    pub const fn wrapping_add_offset(self, delta: u32) -> Self {
        Self {
            allocation: self.allocation,
            generation: self.generation,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

/// A bit-packed function address.
///
/// Besides the function index, the packed form carries the callee's input and
/// output arity so indirect calls can be dynamically signature-checked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FunctionAddress {
    /// Index into the program's function table.
    pub index: u16,
    /// Declared input arity.
    pub input_count: u8,
    /// Declared output arity.
    pub output_count: u8,
}

impl FunctionAddress {
    /// The all-ones pattern reserved for the null function address.
    pub const NULL: Self = Self::unpack(u64::MAX);

    /// Packs the function address into its 64-bit representation.
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.index as u64) | ((self.input_count as u64) << 16) | ((self.output_count as u64) << 24)
    }

    /// Unpacks a function address from its 64-bit representation.
    #[must_use]
    pub const fn unpack(bits: u64) -> Self {
        Self {
            index: bits as u16,
            input_count: (bits >> 16) as u8,
            output_count: (bits >> 24) as u8,
        }
    }

    /// Returns `true` if this is the reserved null function address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == u16::MAX && self.input_count == u8::MAX && self.output_count == u8::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_at_field_corners() {
        for allocation in [0u32, 1, 0x1234, (1 << 30) - 1] {
            for generation in 0u8..4 {
                for offset in [0u32, 1, 0xdead_beef, u32::MAX] {
                    let addr = Address {
                        allocation,
                        generation,
                        offset,
                    };
                    assert_eq!(Address::unpack(addr.pack()), addr);
                }
            }
        }
    }

    #[test]
    fn address_increment_changes_allocation_first() {
        let addr = Address {
            allocation: 7,
            generation: 1,
            offset: 42,
        };
        let bumped = Address::unpack(addr.pack() + 1);
        assert_eq!(bumped.allocation, 8);
        assert_eq!(bumped.generation, 1);
        assert_eq!(bumped.offset, 42);
    }

    #[test]
    fn null_address_is_all_ones() {
        assert_eq!(Address::NULL.pack(), u64::MAX);
        assert!(Address::NULL.is_null());
        assert!(!Address::new(0, 0).is_null());
    }

    #[test]
    fn function_address_roundtrips() {
        let f = FunctionAddress {
            index: 0x0102,
            input_count: 3,
            output_count: 250,
        };
        assert_eq!(FunctionAddress::unpack(f.pack()), f);
        assert!(FunctionAddress::NULL.is_null());
    }

    #[test]
    fn value_views_share_bits() {
        let v = Value::from_sint(-1);
        assert_eq!(v.as_uint(), u64::MAX);
        assert!(v.as_address().is_null());
    }
}
