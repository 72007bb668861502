//! The immutable-for-the-life-of-an-open-index geometry and the
//! virtual-chapter -> physical-slot mapping function.

use crate::error::{Error, Result};

/// The single virtual chapter whose physical slot deviates from the
/// modular mapping. At most one of these exists at a
/// time; its absence is represented as `Geometry::remap == None` rather
/// than a sentinel value in the (virtual, physical) pair, since the
/// on-disk encoding (layout.rs) needs an explicit "is there one" bit
/// anyway and a `u64`/`u32` sentinel would just relocate the ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemappedChapter {
    pub virtual_chapter: u64,
    pub physical_slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_page: u32,
    pub record_pages_per_chapter: u32,
    pub index_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,
    pub remap: Option<RemappedChapter>,
}

impl Geometry {
    pub fn new(
        bytes_per_page: u32,
        record_pages_per_chapter: u32,
        index_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
    ) -> Result<Self> {
        if bytes_per_page == 0 || bytes_per_page % 4096 != 0 {
            return Err(Error::InvalidArgument(format!(
                "bytes_per_page {bytes_per_page} must be a positive multiple of 4096"
            )));
        }
        if record_pages_per_chapter == 0 {
            return Err(Error::InvalidArgument(
                "record_pages_per_chapter must be positive".into(),
            ));
        }
        if index_pages_per_chapter == 0 {
            return Err(Error::InvalidArgument(
                "index_pages_per_chapter must be positive".into(),
            ));
        }
        if chapters_per_volume < 2 {
            return Err(Error::InvalidArgument(
                "chapters_per_volume must be at least 2".into(),
            ));
        }
        if sparse_chapters_per_volume >= chapters_per_volume {
            return Err(Error::InvalidArgument(
                "sparse_chapters_per_volume must be less than chapters_per_volume".into(),
            ));
        }
        Ok(Self {
            bytes_per_page,
            record_pages_per_chapter,
            index_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            remap: None,
        })
    }

    pub fn pages_per_chapter(&self) -> u32 {
        self.record_pages_per_chapter + self.index_pages_per_chapter
    }

    pub fn bytes_per_chapter(&self) -> u64 {
        self.pages_per_chapter() as u64 * self.bytes_per_page as u64
    }

    /// Number of index-page-map entries describing one chapter: every
    /// index page has a boundary-key entry except the chapter's last
    /// one.
    pub fn entries_per_chapter(&self) -> u32 {
        self.index_pages_per_chapter - 1
    }

    /// Maps a virtual chapter number to its physical slot, honoring
    /// the single remap exception if it applies.
    pub fn map_to_physical(&self, virtual_chapter: u64) -> u32 {
        if let Some(remap) = self.remap {
            if remap.virtual_chapter == virtual_chapter {
                return remap.physical_slot;
            }
        }
        (virtual_chapter % self.chapters_per_volume as u64) as u32
    }

    const NO_REMAP: u64 = u64::MAX;

    /// Persists geometry as a save-ring component. Uses the same
    /// `u64::MAX` "no remap" sentinel as the super-block encoding
    /// (layout.rs), since the two formats describe the same field.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        buf.extend_from_slice(&self.bytes_per_page.to_le_bytes());
        buf.extend_from_slice(&self.record_pages_per_chapter.to_le_bytes());
        buf.extend_from_slice(&self.index_pages_per_chapter.to_le_bytes());
        buf.extend_from_slice(&self.chapters_per_volume.to_le_bytes());
        buf.extend_from_slice(&self.sparse_chapters_per_volume.to_le_bytes());
        let (remapped_virtual, remapped_physical) = match self.remap {
            Some(r) => (r.virtual_chapter, r.physical_slot as u64),
            None => (0, Self::NO_REMAP),
        };
        buf.extend_from_slice(&remapped_virtual.to_le_bytes());
        buf.extend_from_slice(&remapped_physical.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 20 + 16 {
            return Err(Error::CorruptData("geometry component has wrong length".into()));
        }
        let bytes_per_page = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let record_pages_per_chapter = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let index_pages_per_chapter = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let chapters_per_volume = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let sparse_chapters_per_volume = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let remapped_virtual = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let remapped_physical = u64::from_le_bytes(buf[28..36].try_into().unwrap());
        let remap = if remapped_physical == Self::NO_REMAP {
            None
        } else {
            Some(RemappedChapter {
                virtual_chapter: remapped_virtual,
                physical_slot: remapped_physical as u32,
            })
        };
        Ok(Self {
            bytes_per_page,
            record_pages_per_chapter,
            index_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            remap,
        })
    }
}
