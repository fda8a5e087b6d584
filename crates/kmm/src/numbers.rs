//! Frame and page numbers.
//!
//! A frame number is the bitmap index the [`PhysicalMemoryManager`](crate::PhysicalMemoryManager)
//! tracks; keeping it a distinct type from [`PhysicalAddress`] keeps byte addresses, frame indices
//! and bit offsets from being mixed up.

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical frame number: the physical address divided by [`PAGE_SIZE`]."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_SIZE)
    }

    /// Returns the physical address one past the end of this frame.
    #[inline]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 + 1) * PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual page number: the virtual address divided by [`PAGE_SIZE`]."
);

impl PageNumber {
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * PAGE_SIZE)
    }

    #[inline]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new((self.0 + 1) * PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bounds() {
        let frame = FrameNumber::new(3);
        assert_eq!(frame.start(), PhysicalAddress::new(0x3000));
        assert_eq!(frame.end(), PhysicalAddress::new(0x4000));
        assert_eq!(FrameNumber::from(PhysicalAddress::new(0x3fff)), frame);
    }

    #[test]
    fn page_bounds() {
        let page = PageNumber::from(VirtualAddress::new(0xD000_0123));
        assert_eq!(page.start(), VirtualAddress::new(0xD000_0000));
        assert_eq!(page.end(), VirtualAddress::new(0xD000_1000));
        assert_eq!((page + 2) - page, 2);
    }
}
