//! Read-only residency oracle.
//!
//! The kernel knows which native pages under a huge page are unbacked or
//! swapped; the filler only uses that information for statistics, never
//! for placement. The oracle's native page size may differ from the
//! allocator's page size, so consumers scale bit indices accordingly.

use thiserror::Error;

use crate::bitmap::ResidencyBitmap;
use crate::pages::MAX_RESIDENCY_BITS;

/// Per-huge-page residency bitmaps, one bit per native page.
#[derive(Clone, Copy, Debug, Default)]
pub struct SinglePageBitmaps {
    pub unbacked: ResidencyBitmap,
    pub swapped: ResidencyBitmap,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResidencyError {
    /// The oracle has no data for this address.
    #[error("residency information unavailable")]
    Unavailable,
    /// The oracle reported fewer native pages than the region holds.
    #[error("truncated residency data: got {got} native pages, want {want}")]
    Truncated { got: usize, want: usize },
}

/// Source of residency bitmaps for huge-page regions.
pub trait Residency {
    /// Bitmaps of unbacked and swapped native pages for the huge page at
    /// `addr`.
    fn get_unbacked_and_swapped(&self, addr: u64) -> Result<SinglePageBitmaps, ResidencyError>;

    /// Native pages per huge page on this system. At most
    /// [`MAX_RESIDENCY_BITS`].
    fn native_pages_in_huge_page(&self) -> usize;
}

/// Test oracle reporting the first half of each huge page unbacked and the
/// second half swapped, for any address.
#[derive(Debug, Clone, Copy)]
pub struct FakeResidency {
    native_pages: usize,
}

impl Default for FakeResidency {
    fn default() -> Self {
        Self::new(MAX_RESIDENCY_BITS)
    }
}

impl FakeResidency {
    #[must_use]
    pub fn new(native_pages: usize) -> Self {
        assert!(native_pages <= MAX_RESIDENCY_BITS);
        Self { native_pages }
    }
}

impl Residency for FakeResidency {
    fn get_unbacked_and_swapped(&self, _addr: u64) -> Result<SinglePageBitmaps, ResidencyError> {
        let mut bitmaps = SinglePageBitmaps::default();
        bitmaps.unbacked.set_range(0, self.native_pages / 2);
        bitmaps
            .swapped
            .set_range(self.native_pages / 2, self.native_pages / 2);
        Ok(bitmaps)
    }

    fn native_pages_in_huge_page(&self) -> usize {
        self.native_pages
    }
}
