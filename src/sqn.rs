//! 32-bit circular sequence numbers.
//!
//! PGM sequence numbers live in a wrap-around space; ordering is defined by
//! the sign of the 32-bit difference, never by absolute comparison. `Sqn`
//! deliberately does not implement `Ord` — circular order is not total.

/// A PGM sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sqn(pub u32);

impl Sqn {
    /// `self` strictly precedes `other` in circular order.
    #[inline]
    pub fn lt(self, other: Sqn) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// `self` precedes or equals `other`.
    #[inline]
    pub fn lte(self, other: Sqn) -> bool {
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    /// `self` strictly follows `other`.
    #[inline]
    pub fn gt(self, other: Sqn) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// `self` follows or equals `other`.
    #[inline]
    pub fn gte(self, other: Sqn) -> bool {
        (self.0.wrapping_sub(other.0) as i32) >= 0
    }

    #[inline]
    pub fn wrapping_add(self, val: u32) -> Sqn {
        Sqn(self.0.wrapping_add(val))
    }

    #[inline]
    pub fn wrapping_sub(self, other: Sqn) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    #[inline]
    pub fn next(self) -> Sqn {
        self.wrapping_add(1)
    }

    #[inline]
    pub fn prev(self) -> Sqn {
        Sqn(self.0.wrapping_sub(1))
    }
}

impl From<u32> for Sqn {
    fn from(val: u32) -> Self {
        Sqn(val)
    }
}

impl std::fmt::Display for Sqn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Iterator over the inclusive circular range `[first, last]`.
pub fn range_inclusive(first: Sqn, last: Sqn) -> impl Iterator<Item = Sqn> {
    let count = last.wrapping_sub(first).wrapping_add(1);
    (0..count).map(move |i| first.wrapping_add(i))
}
