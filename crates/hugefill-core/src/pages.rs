//! Page-level units.
//!
//! Everything the filler hands out or accounts for is measured in whole
//! pages. `Length` counts pages, `PageId` names one, `HugePage` names an
//! aligned huge-page region and `HugeLength` counts those. Conversions to
//! and from byte addresses go through the shift constants below; nothing
//! else in the crate does raw pointer math.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Rem, Sub, SubAssign};

use serde::Serialize;

/// log2 of the allocator page size (8 KiB pages).
pub const PAGE_SHIFT: usize = 13;

/// Allocator page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of the huge page size (2 MiB).
pub const HUGE_PAGE_SHIFT: usize = 21;

/// Huge page size in bytes.
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;

/// Allocator pages per huge page (256 at the default shifts).
pub const PAGES_PER_HUGE_PAGE: Length = Length((HUGE_PAGE_SIZE / PAGE_SIZE) as u64);

/// Spans longer than this are "large" for span statistics.
pub const MAX_SMALL_PAGES: Length = Length(64);

/// Upper bound of native (kernel) pages the residency oracle may report
/// for one huge page. Covers 4 KiB native pages under a 2 MiB huge page.
pub const MAX_RESIDENCY_BITS: usize = 512;

/// A count of allocator pages.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Length(pub u64);

impl Length {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn in_bytes(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Number of whole pages covered by `bytes`, rounding down.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes >> PAGE_SHIFT)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Debug for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.0)
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Length {
    type Output = Length;
    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl AddAssign for Length {
    fn add_assign(&mut self, rhs: Length) {
        self.0 += rhs.0;
    }
}

impl Sub for Length {
    type Output = Length;
    fn sub(self, rhs: Length) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl SubAssign for Length {
    fn sub_assign(&mut self, rhs: Length) {
        self.0 -= rhs.0;
    }
}

impl Mul<u64> for Length {
    type Output = Length;
    fn mul(self, rhs: u64) -> Length {
        Length(self.0 * rhs)
    }
}

impl Div<u64> for Length {
    type Output = Length;
    fn div(self, rhs: u64) -> Length {
        Length(self.0 / rhs)
    }
}

impl Rem<u64> for Length {
    type Output = Length;
    fn rem(self, rhs: u64) -> Length {
        Length(self.0 % rhs)
    }
}

/// Index of one allocator page in the virtual address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn from_addr(addr: u64) -> Self {
        Self(addr >> PAGE_SHIFT as u64)
    }

    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0 << PAGE_SHIFT as u64
    }

    #[must_use]
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page{}", self.0)
    }
}

impl Add<Length> for PageId {
    type Output = PageId;
    fn add(self, rhs: Length) -> PageId {
        PageId(self.0 + rhs.0)
    }
}

impl AddAssign<Length> for PageId {
    fn add_assign(&mut self, rhs: Length) {
        self.0 += rhs.0;
    }
}

impl Sub<Length> for PageId {
    type Output = PageId;
    fn sub(self, rhs: Length) -> PageId {
        PageId(self.0 - rhs.0)
    }
}

impl Sub for PageId {
    type Output = Length;
    fn sub(self, rhs: PageId) -> Length {
        Length(self.0 - rhs.0)
    }
}

/// A naturally-aligned huge-page region, named by its huge-page index.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HugePage(u64);

impl HugePage {
    /// The huge page containing `addr`, rounding down to alignment.
    #[must_use]
    pub const fn containing(addr: u64) -> Self {
        Self(addr >> HUGE_PAGE_SHIFT as u64)
    }

    /// The huge page containing a given allocator page.
    #[must_use]
    pub const fn containing_page(p: PageId) -> Self {
        Self::containing(p.addr())
    }

    #[must_use]
    pub const fn start_addr(self) -> u64 {
        self.0 << HUGE_PAGE_SHIFT as u64
    }

    #[must_use]
    pub const fn first_page(self) -> PageId {
        PageId::from_addr(self.start_addr())
    }

    #[must_use]
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for HugePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hp@{:#x}", self.start_addr())
    }
}

/// A count of huge pages.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct HugeLength(pub u64);

/// Shorthand constructor matching the reading "n huge pages".
#[must_use]
pub const fn n_huge_pages(n: u64) -> HugeLength {
    HugeLength(n)
}

impl HugeLength {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn in_pages(self) -> Length {
        Length(self.0 * PAGES_PER_HUGE_PAGE.0)
    }

    #[must_use]
    pub const fn in_bytes(self) -> u64 {
        self.0 << HUGE_PAGE_SHIFT as u64
    }
}

impl fmt::Debug for HugeLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}hp", self.0)
    }
}

impl Add for HugeLength {
    type Output = HugeLength;
    fn add(self, rhs: HugeLength) -> HugeLength {
        HugeLength(self.0 + rhs.0)
    }
}

impl AddAssign for HugeLength {
    fn add_assign(&mut self, rhs: HugeLength) {
        self.0 += rhs.0;
    }
}

impl Sub for HugeLength {
    type Output = HugeLength;
    fn sub(self, rhs: HugeLength) -> HugeLength {
        HugeLength(self.0 - rhs.0)
    }
}

impl SubAssign for HugeLength {
    fn sub_assign(&mut self, rhs: HugeLength) {
        self.0 -= rhs.0;
    }
}

/// A contiguous run of allocator pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: PageId,
    pub n: Length,
}

impl Range {
    #[must_use]
    pub const fn new(start: PageId, n: Length) -> Self {
        Self { start, n }
    }

    /// One past the last page of the range.
    #[must_use]
    pub fn end(self) -> PageId {
        self.start + self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_arithmetic() {
        let a = Length(10);
        let b = Length(3);
        assert_eq!(a + b, Length(13));
        assert_eq!(a - b, Length(7));
        assert_eq!(a * 2, Length(20));
        assert_eq!(a / 3, Length(3));
        assert_eq!(a % 3, Length(1));
        assert_eq!(a.saturating_sub(Length(20)), Length(0));
    }

    #[test]
    fn length_byte_conversions() {
        assert_eq!(Length(1).in_bytes(), PAGE_SIZE as u64);
        assert_eq!(Length::from_bytes(PAGE_SIZE as u64 * 5 + 17), Length(5));
    }

    #[test]
    fn pages_per_huge_page_matches_shifts() {
        assert_eq!(PAGES_PER_HUGE_PAGE, Length(256));
        assert_eq!(
            PAGES_PER_HUGE_PAGE.in_bytes(),
            HUGE_PAGE_SIZE as u64
        );
    }

    #[test]
    fn page_id_address_round_trip() {
        let p = PageId::from_addr(0x1abc_de20_0000);
        assert_eq!(PageId::from_addr(p.addr()), p);
        assert_eq!((p + Length(4)) - p, Length(4));
    }

    #[test]
    fn huge_page_rounds_down() {
        let hp = HugePage::containing(HUGE_PAGE_SIZE as u64 * 3 + 12345);
        assert_eq!(hp.start_addr(), HUGE_PAGE_SIZE as u64 * 3);
        assert_eq!(hp.first_page().addr(), hp.start_addr());
    }

    #[test]
    fn huge_length_in_pages() {
        assert_eq!(n_huge_pages(2).in_pages(), Length(512));
        assert_eq!(n_huge_pages(1).in_bytes(), HUGE_PAGE_SIZE as u64);
    }

    #[test]
    fn range_end() {
        let r = Range::new(PageId(100), Length(28));
        assert_eq!(r.end(), PageId(128));
    }
}
