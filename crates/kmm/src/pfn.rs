use crate::addr::{PAddr, PAGE_SHIFT};
use core::ops::{Add, BitXor, Sub};

/// A physical frame number: a physical address with the low `PAGE_SHIFT`
/// bits stripped off.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PFN(pub usize);

impl PFN {
    pub const fn from_val(val: usize) -> Self {
        Self(val)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<PAddr> for PFN {
    fn from(paddr: PAddr) -> Self {
        Self(paddr.addr() >> PAGE_SHIFT)
    }
}

impl From<PFN> for PAddr {
    fn from(pfn: PFN) -> Self {
        PAddr::new(pfn.0 << PAGE_SHIFT)
    }
}

impl Add<usize> for PFN {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for PFN {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self {
        Self(self.0 - rhs)
    }
}

impl Sub<PFN> for PFN {
    type Output = usize;
    fn sub(self, rhs: PFN) -> usize {
        self.0 - rhs.0
    }
}

impl BitXor<usize> for PFN {
    type Output = Self;
    fn bitxor(self, rhs: usize) -> Self {
        Self(self.0 ^ rhs)
    }
}
