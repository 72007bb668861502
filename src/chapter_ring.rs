//! The chapter ring (virtual-to-physical chapter mapping) and its
//! index-page-map shadow.

use crate::assertions::ensure_invariant;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::page::AlignedBuf;
use crate::volume_store::VolumeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// Normal ring aging.
    Expire,
    /// Error-recovery eviction.
    Invalidate,
}

/// One index page's boundary-key summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMapEntry {
    pub delta_list_terminator: u32,
    pub boundary_key: u64,
}

impl PageMapEntry {
    pub const ENCODED_LEN: usize = 12;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.delta_list_terminator.to_le_bytes());
        out[4..12].copy_from_slice(&self.boundary_key.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            delta_list_terminator: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            boundary_key: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        }
    }
}

/// A dense array of `chapters_per_volume * entries_per_chapter`
/// entries. Slot `physical`'s entries describe whatever chapter
/// currently lives in that physical slot.
#[derive(Debug, Clone)]
pub struct IndexPageMap {
    entries_per_chapter: u32,
    entries: Vec<PageMapEntry>,
}

impl IndexPageMap {
    pub fn new(chapters_per_volume: u32, entries_per_chapter: u32) -> Self {
        Self {
            entries_per_chapter,
            entries: vec![PageMapEntry::default(); chapters_per_volume as usize * entries_per_chapter as usize],
        }
    }

    pub fn entries_per_chapter(&self) -> u32 {
        self.entries_per_chapter
    }

    fn slot_range(&self, physical: u32) -> std::ops::Range<usize> {
        let start = physical as usize * self.entries_per_chapter as usize;
        start..start + self.entries_per_chapter as usize
    }

    pub fn entries_for_slot(&self, physical: u32) -> &[PageMapEntry] {
        &self.entries[self.slot_range(physical)]
    }

    pub fn entries_for_slot_mut(&mut self, physical: u32) -> &mut [PageMapEntry] {
        let range = self.slot_range(physical);
        &mut self.entries[range]
    }

    pub fn zero_slot(&mut self, physical: u32) {
        self.entries_for_slot_mut(physical).fill(PageMapEntry::default());
    }

    /// `copy_slot`: duplicates one physical slot's entries into another.
    pub fn copy_slot(&mut self, from_physical: u32, to_physical: u32) {
        if from_physical == to_physical {
            return;
        }
        let src: Vec<PageMapEntry> = self.entries_for_slot(from_physical).to_vec();
        self.entries_for_slot_mut(to_physical).copy_from_slice(&src);
    }

    /// `shift_down`: moves every entry down by `by_slots` chapters' worth
    /// of entries; the vacated tail is zeroed and ignored on save.
    pub fn shift_down(&mut self, by_slots: u32) {
        let shift = by_slots as usize * self.entries_per_chapter as usize;
        if shift == 0 {
            return;
        }
        let len = self.entries.len();
        if shift >= len {
            self.entries.iter_mut().for_each(|e| *e = PageMapEntry::default());
            return;
        }
        self.entries.copy_within(shift.., 0);
        for e in &mut self.entries[len - shift..] {
            *e = PageMapEntry::default();
        }
    }

    /// Drops the map down to describe exactly `new_chapters_per_volume`
    /// slots, discarding the now-meaningless tail left over from
    /// `shift_down`.
    pub fn truncate_chapters(&mut self, new_chapters_per_volume: u32) {
        let new_len = new_chapters_per_volume as usize * self.entries_per_chapter as usize;
        self.entries.truncate(new_len);
    }

    pub fn chapters_len(&self) -> u32 {
        (self.entries.len() / self.entries_per_chapter.max(1) as usize) as u32
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * PageMapEntry::ENCODED_LEN);
        let mut scratch = [0u8; PageMapEntry::ENCODED_LEN];
        for entry in &self.entries {
            entry.encode(&mut scratch);
            buf.extend_from_slice(&scratch);
        }
        buf
    }

    pub fn decode(buf: &[u8], entries_per_chapter: u32) -> Result<Self> {
        if buf.len() % PageMapEntry::ENCODED_LEN != 0 {
            return Err(Error::CorruptData("index-page-map length misaligned".into()));
        }
        let entries = buf
            .chunks_exact(PageMapEntry::ENCODED_LEN)
            .map(PageMapEntry::decode)
            .collect();
        Ok(Self {
            entries_per_chapter,
            entries,
        })
    }
}

/// Ring state: which virtual chapters currently exist, and where.
pub struct ChapterRing {
    pub geometry: Geometry,
    oldest_virtual_chapter: u64,
    newest_virtual_chapter: Option<u64>,
    pub page_map: IndexPageMap,
}

impl ChapterRing {
    /// `open_chapter_ring`: initializes ring bounds from persisted state.
    pub fn open(geometry: Geometry, oldest: u64, newest: Option<u64>, page_map: IndexPageMap) -> Result<Self> {
        if let Some(newest) = newest {
            ensure_invariant!(
                newest >= oldest,
                "newest_virtual_chapter {newest} precedes oldest_virtual_chapter {oldest}"
            );
            ensure_invariant!(
                newest - oldest <= geometry.chapters_per_volume as u64 - 1,
                "ring span {} exceeds chapters_per_volume {}",
                newest - oldest + 1,
                geometry.chapters_per_volume
            );
        }
        Ok(Self {
            geometry,
            oldest_virtual_chapter: oldest,
            newest_virtual_chapter: newest,
            page_map,
        })
    }

    pub fn empty(geometry: Geometry) -> Self {
        let page_map = IndexPageMap::new(geometry.chapters_per_volume, geometry.entries_per_chapter());
        Self {
            geometry,
            oldest_virtual_chapter: 0,
            newest_virtual_chapter: None,
            page_map,
        }
    }

    pub fn oldest(&self) -> u64 {
        self.oldest_virtual_chapter
    }

    pub fn newest(&self) -> Option<u64> {
        self.newest_virtual_chapter
    }

    pub fn physical_slot(&self, virtual_chapter: u64) -> u32 {
        self.geometry.map_to_physical(virtual_chapter)
    }

    /// `allocate_next_chapter`: the only path (outside of convert) that
    /// advances `oldest_virtual_chapter`, via a forced expiry when the
    /// ring would otherwise overflow.
    pub fn allocate_next_chapter(&mut self) -> Result<u64> {
        let next = match self.newest_virtual_chapter {
            None => 0,
            Some(newest) => newest + 1,
        };
        if let Some(newest) = self.newest_virtual_chapter {
            if newest - self.oldest_virtual_chapter + 1 == self.geometry.chapters_per_volume as u64 {
                self.expire_chapter(self.oldest_virtual_chapter, ExpirePolicy::Expire)?;
            }
        }
        Ok(next)
    }

    /// `expire_chapter`: frees a slot and, if it was the oldest, advances
    /// `oldest_virtual_chapter`.
    pub fn expire_chapter(&mut self, virtual_chapter: u64, _policy: ExpirePolicy) -> Result<()> {
        let physical = self.physical_slot(virtual_chapter);
        self.page_map.zero_slot(physical);
        if self.newest_virtual_chapter == Some(virtual_chapter)
            && virtual_chapter == self.oldest_virtual_chapter
        {
            self.newest_virtual_chapter = None;
        }
        if virtual_chapter == self.oldest_virtual_chapter {
            self.oldest_virtual_chapter += 1;
        }
        Ok(())
    }

    fn check_chapter_in_range(&self, virtual_chapter: u64) -> Result<u64> {
        let newest = self.newest_virtual_chapter.ok_or(Error::NoSuchChapter {
            virtual_chapter,
            oldest: self.oldest_virtual_chapter,
            newest: self.oldest_virtual_chapter,
        })?;
        if virtual_chapter < self.oldest_virtual_chapter || virtual_chapter > newest {
            return Err(Error::NoSuchChapter {
                virtual_chapter,
                oldest: self.oldest_virtual_chapter,
                newest,
            });
        }
        Ok(newest)
    }

    /// `write_chapter`: writes `pages_per_chapter` pages, fsyncs, then
    /// publishes the index-page-map entries and the new ring high-water
    /// mark. The sync happens before the map/ring update so a crash
    /// never leaves the map pointing at a chapter whose bytes aren't on
    /// disk yet.
    pub fn write_chapter(
        &mut self,
        store: &VolumeStore,
        virtual_chapter: u64,
        pages: &[AlignedBuf],
        entries: &[PageMapEntry],
    ) -> Result<()> {
        let pages_per_chapter = self.geometry.pages_per_chapter();
        ensure_invariant!(
            pages.len() as u32 == pages_per_chapter,
            "write_chapter got {} pages, expected {pages_per_chapter}",
            pages.len()
        );
        ensure_invariant!(
            entries.len() as u32 == self.geometry.entries_per_chapter(),
            "write_chapter got {} index-page-map entries, expected {}",
            entries.len(),
            self.geometry.entries_per_chapter()
        );

        let physical = self.physical_slot(virtual_chapter);
        let base_page = physical as u64 * pages_per_chapter as u64;
        for (i, page) in pages.iter().enumerate() {
            store.write_page(base_page + i as u64, page)?;
        }
        store.sync()?;

        self.page_map.entries_for_slot_mut(physical).copy_from_slice(entries);
        self.newest_virtual_chapter = Some(virtual_chapter);
        Ok(())
    }

    /// `read_chapter`: inverse of `write_chapter`.
    pub fn read_chapter(&self, store: &VolumeStore, virtual_chapter: u64) -> Result<Vec<AlignedBuf>> {
        self.check_chapter_in_range(virtual_chapter)?;
        let physical = self.physical_slot(virtual_chapter);
        let pages_per_chapter = self.geometry.pages_per_chapter();
        let base_page = physical as u64 * pages_per_chapter as u64;

        let mut pages = Vec::with_capacity(pages_per_chapter as usize);
        for i in 0..pages_per_chapter as u64 {
            let mut page = store.page_new()?;
            store.read_page(base_page + i, &mut page)?;
            pages.push(page);
        }
        Ok(pages)
    }

    const NO_NEWEST: u64 = u64::MAX;

    /// Persists `oldest_virtual_chapter`/`newest_virtual_chapter` as a
    /// save-ring component; the page map and geometry are saved
    /// separately (geometry.rs, IndexPageMap::encode).
    pub fn encode_bounds(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.oldest_virtual_chapter.to_le_bytes());
        buf.extend_from_slice(&self.newest_virtual_chapter.unwrap_or(Self::NO_NEWEST).to_le_bytes());
        buf
    }

    pub fn decode_bounds(buf: &[u8]) -> Result<(u64, Option<u64>)> {
        if buf.len() != 16 {
            return Err(Error::CorruptData("ring-bounds component has wrong length".into()));
        }
        let oldest = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let newest_raw = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let newest = if newest_raw == Self::NO_NEWEST { None } else { Some(newest_raw) };
        Ok((oldest, newest))
    }

    /// `relocate_chapter`: used only by convert-to-LVM. Copies a whole
    /// chapter's bytes between physical slots through a transient
    /// buffer; does not sync and does not touch the page map (the
    /// caller updates both once the relocation algorithm completes).
    pub fn relocate_chapter(&self, store: &VolumeStore, from_physical: u32, to_physical: u32) -> Result<()> {
        let pages_per_chapter = self.geometry.pages_per_chapter() as u64;
        let mut buf = store.page_new()?;
        let from_base = from_physical as u64 * pages_per_chapter;
        let to_base = to_physical as u64 * pages_per_chapter;
        for i in 0..pages_per_chapter {
            store.read_page(from_base + i, &mut buf)?;
            store.write_page(to_base + i, &buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;

    use crate::region::ByteRegion;

    fn geom(chapters: u32) -> Geometry {
        Geometry::new(4096, 2, 2, chapters, 0).unwrap()
    }

    fn store_for(geometry: &Geometry) -> VolumeStore {
        let pages_per_chapter = geometry.pages_per_chapter() as u64;
        let total_pages = pages_per_chapter * geometry.chapters_per_volume as u64;
        let len = total_pages * geometry.bytes_per_page as u64;
        let mut f = tempfile::tempfile().unwrap();
        f.seek(SeekFrom::Start(len - 1)).unwrap();
        f.write_all(&[0]).unwrap();
        let arc = Arc::new(f);
        let region = ByteRegion::new(Arc::clone(&arc), 0, len);
        VolumeStore::open(region, geometry.bytes_per_page, &arc).unwrap()
    }

    fn chapter_pages(store: &VolumeStore, geometry: &Geometry, fill: u8) -> Vec<AlignedBuf> {
        (0..geometry.pages_per_chapter())
            .map(|_| {
                let mut p = store.page_new().unwrap();
                p.as_mut_slice().fill(fill);
                p
            })
            .collect()
    }

    #[test]
    fn p1_ring_bounds_hold_after_fill_and_wrap() {
        let geometry = geom(4);
        let store = store_for(&geometry);
        let mut ring = ChapterRing::empty(geometry);

        for v in 0..6u64 {
            let virt = ring.allocate_next_chapter().unwrap();
            assert_eq!(virt, v);
            let pages = chapter_pages(&store, &geometry, v as u8);
            let entries = vec![PageMapEntry::default(); geometry.entries_per_chapter() as usize];
            ring.write_chapter(&store, virt, &pages, &entries).unwrap();

            assert!(ring.newest().unwrap() <= ring.oldest() + geometry.chapters_per_volume as u64 - 1);
        }
        assert_eq!(ring.oldest(), 2);
        assert_eq!(ring.newest(), Some(5));
    }

    #[test]
    fn p2_mapping_is_injective_within_ring_span() {
        let geometry = geom(8);
        let mut seen = std::collections::HashSet::new();
        for v in 10..18u64 {
            let p = geometry.map_to_physical(v);
            assert!(seen.insert(p), "physical slot {p} reused within one ring span");
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let geometry = geom(4);
        let store = store_for(&geometry);
        let mut ring = ChapterRing::empty(geometry);

        let virt = ring.allocate_next_chapter().unwrap();
        let pages = chapter_pages(&store, &geometry, 0x55);
        let entries = vec![PageMapEntry::default(); geometry.entries_per_chapter() as usize];
        ring.write_chapter(&store, virt, &pages, &entries).unwrap();

        let read_back = ring.read_chapter(&store, virt).unwrap();
        for page in &read_back {
            assert!(page.as_slice().iter().all(|&b| b == 0x55));
        }
    }

    #[test]
    fn overfill_expires_oldest_and_reading_it_fails() {
        let geometry = geom(16);
        let store = store_for(&geometry);
        let mut ring = ChapterRing::empty(geometry);
        let entries = vec![PageMapEntry::default(); geometry.entries_per_chapter() as usize];

        for v in 0..16u64 {
            let virt = ring.allocate_next_chapter().unwrap();
            let pages = chapter_pages(&store, &geometry, v as u8);
            ring.write_chapter(&store, virt, &pages, &entries).unwrap();
        }
        assert_eq!(ring.oldest(), 0);
        assert_eq!(ring.newest(), Some(15));

        let virt = ring.allocate_next_chapter().unwrap();
        assert_eq!(virt, 16);
        assert_eq!(ring.oldest(), 1);
        let pages = chapter_pages(&store, &geometry, 16);
        ring.write_chapter(&store, virt, &pages, &entries).unwrap();

        assert_eq!(ring.physical_slot(16), 0);
        assert!(matches!(
            ring.read_chapter(&store, 0),
            Err(Error::NoSuchChapter { .. })
        ));
    }

    #[test]
    fn index_page_map_copy_and_shift() {
        let mut map = IndexPageMap::new(4, 2);
        map.entries_for_slot_mut(0).copy_from_slice(&[
            PageMapEntry {
                delta_list_terminator: 1,
                boundary_key: 100,
            },
            PageMapEntry {
                delta_list_terminator: 2,
                boundary_key: 200,
            },
        ]);
        map.copy_slot(0, 3);
        assert_eq!(map.entries_for_slot(3), map.entries_for_slot(0));

        map.shift_down(1);
        assert_eq!(map.entries_for_slot(2)[0].boundary_key, 100);
        assert_eq!(map.entries_for_slot(3), &[PageMapEntry::default(); 2]);
    }

    #[test]
    fn ring_bounds_round_trip() {
        let geometry = geom(8);
        let page_map = IndexPageMap::new(geometry.chapters_per_volume, geometry.entries_per_chapter());
        let ring = ChapterRing::open(geometry, 2, Some(5), page_map).unwrap();
        let (oldest, newest) = ChapterRing::decode_bounds(&ring.encode_bounds()).unwrap();
        assert_eq!(oldest, 2);
        assert_eq!(newest, Some(5));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut map = IndexPageMap::new(3, 2);
        map.entries_for_slot_mut(1)[0] = PageMapEntry {
            delta_list_terminator: 7,
            boundary_key: 9001,
        };
        let encoded = map.encode();
        let decoded = IndexPageMap::decode(&encoded, 2).unwrap();
        assert_eq!(decoded.entries_for_slot(1), map.entries_for_slot(1));
    }
}
