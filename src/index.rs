//! Composition root: owns one open index's layout/store/ring state
//! plus its save ring, and exposes `format`/`open`/`close` the way a
//! caller outside this crate would actually drive it. Wires the
//! storage, layout, chapter-ring, and request-queue pieces together as
//! a single owner rather than a graph of back-pointers between
//! session, router, index, and layout/volume objects.

use std::path::PathBuf;

use crate::chapter_ring::{ChapterRing, IndexPageMap};
use crate::convert::{self, ConvertReport};
use crate::error::Result;
use crate::geometry::Geometry;
use crate::index_state::IndexState;
use crate::layout::{IndexConfig, Layout};
use crate::queue::Request;
use crate::volume_store::VolumeStore;

const COMPONENT_GEOMETRY: &str = "geometry";
const COMPONENT_PAGE_MAP: &str = "page_map";
const COMPONENT_RING_BOUNDS: &str = "ring_bounds";

pub struct OpenIndex {
    pub layout: Layout,
    pub store: VolumeStore,
    pub ring: ChapterRing,
    pub state: IndexState,
}

impl OpenIndex {
    /// Formats a brand-new index and publishes its first save-ring
    /// snapshot so a crash immediately after `format` still leaves a
    /// loadable `current` slot.
    pub fn format(
        name: &str,
        config: IndexConfig,
        geometry: Geometry,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let layout = Layout::make_layout(name, true, &config, &geometry)?;
        let store = VolumeStore::open(layout.open_volume_region(), geometry.bytes_per_page, layout.file_for_stat())?;
        let ring = ChapterRing::empty(geometry);
        let state = IndexState::new(state_dir)?;

        let index = Self {
            layout,
            store,
            ring,
            state,
        };
        index.save(false)?;
        Ok(index)
    }

    /// Re-opens an index previously created by `format`. Returns
    /// whether the last successful save was a checkpoint (meaning a
    /// higher layer, out of scope here, needs to replay request
    /// traffic since that point).
    pub fn open(name: &str, state_dir: impl Into<PathBuf>) -> Result<(Self, bool)> {
        let state = IndexState::new(state_dir)?;
        let (current, needs_replay) = state.load_state()?;

        let geometry = Geometry::decode(&state.read_component(&current, COMPONENT_GEOMETRY)?)?;
        let page_map = IndexPageMap::decode(
            &state.read_component(&current, COMPONENT_PAGE_MAP)?,
            geometry.entries_per_chapter(),
        )?;
        let (oldest, newest) = ChapterRing::decode_bounds(&state.read_component(&current, COMPONENT_RING_BOUNDS)?)?;
        let ring = ChapterRing::open(geometry.clone(), oldest, newest, page_map)?;

        // `make_layout`'s `config` argument is only consulted on the
        // format path; opening an existing device reads the persisted
        // super-block instead, so this placeholder is never read.
        let placeholder_config = IndexConfig {
            mem: 0,
            checkpoint_frequency: 0,
            sparse: false,
            remap: None,
            chapters_per_volume: geometry.chapters_per_volume,
            start_offset_bytes: 0,
        };
        let layout = Layout::make_layout(name, false, &placeholder_config, &geometry)?;
        let store = VolumeStore::open(layout.open_volume_region(), geometry.bytes_per_page, layout.file_for_stat())?;

        Ok((
            Self {
                layout,
                store,
                ring,
                state,
            },
            needs_replay,
        ))
    }

    /// Publishes the current in-memory geometry/page-map/ring-bounds as
    /// a new save-ring snapshot.
    pub fn save(&self, checkpoint: bool) -> Result<()> {
        self.state.prepare_save()?;
        self.state.write_component(COMPONENT_GEOMETRY, &self.ring.geometry.encode())?;
        self.state.write_component(COMPONENT_PAGE_MAP, &self.ring.page_map.encode())?;
        self.state.write_component(COMPONENT_RING_BOUNDS, &self.ring.encode_bounds())?;
        self.state.commit_save(checkpoint)
    }

    pub fn write_chapter(&mut self, virtual_chapter: u64, pages: &[crate::page::AlignedBuf], entries: &[crate::chapter_ring::PageMapEntry]) -> Result<()> {
        self.ring.write_chapter(&self.store, virtual_chapter, pages, entries)
    }

    pub fn read_chapter(&self, virtual_chapter: u64) -> Result<Vec<crate::page::AlignedBuf>> {
        self.ring.read_chapter(&self.store, virtual_chapter)
    }

    /// Runs the in-place shrink against this index's own
    /// layout/ring/store/state, then leaves the index saved with the
    /// super-block already rewritten.
    pub fn convert_to_lvm(&mut self, freed_space_bytes: u64) -> Result<ConvertReport> {
        convert::convert_to_lvm(
            &mut self.layout,
            &mut self.ring,
            &self.store,
            &self.state,
            freed_space_bytes,
        )
    }

    pub fn close(self) -> Result<()> {
        self.store.sync()
    }
}

/// A convenience payload shape for callers wiring the request queue to
/// this index: most request-queue traffic against an open index is
/// either a chapter write or a chapter read.
pub enum IndexOperation {
    Write {
        virtual_chapter: u64,
        pages: Vec<crate::page::AlignedBuf>,
        entries: Vec<crate::chapter_ring::PageMapEntry>,
    },
    Read {
        virtual_chapter: u64,
    },
}

pub type IndexRequest = Request<IndexOperation>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter_ring::PageMapEntry;

    fn config(chapters_per_volume: u32) -> IndexConfig {
        IndexConfig {
            mem: 1,
            checkpoint_frequency: 16,
            sparse: false,
            remap: None,
            chapters_per_volume,
            start_offset_bytes: 0,
        }
    }

    #[test]
    fn format_then_open_preserves_geometry_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let vol_path = dir.path().join("volume.idx");
        let name = format!("file={}", vol_path.display());
        let geometry = Geometry::new(4096, 2, 2, 4, 0).unwrap();

        let mut index = OpenIndex::format(&name, config(4), geometry, dir.path().join("state")).unwrap();

        let entries = vec![PageMapEntry::default(); index.ring.geometry.entries_per_chapter() as usize];
        let pages: Vec<_> = (0..index.ring.geometry.pages_per_chapter())
            .map(|_| index.store.page_new().unwrap())
            .collect();
        let virt = index.ring.allocate_next_chapter().unwrap();
        index.write_chapter(virt, &pages, &entries).unwrap();
        index.save(false).unwrap();
        index.close().unwrap();

        let (reopened, needs_replay) = OpenIndex::open(&name, dir.path().join("state")).unwrap();
        assert!(!needs_replay);
        assert_eq!(reopened.ring.oldest(), 0);
        assert_eq!(reopened.ring.newest(), Some(0));
        assert_eq!(reopened.ring.geometry.chapters_per_volume, 4);
    }

    #[test]
    fn convert_then_reopen_persists_remap() {
        let dir = tempfile::tempdir().unwrap();
        let vol_path = dir.path().join("volume.idx");
        let name = format!("file={}", vol_path.display());
        let geometry = Geometry::new(4096, 2, 2, 4, 0).unwrap();

        let mut index = OpenIndex::format(&name, config(4), geometry, dir.path().join("state")).unwrap();
        let entries = vec![PageMapEntry::default(); index.ring.geometry.entries_per_chapter() as usize];
        for _ in 0..4u32 {
            let virt = index.ring.allocate_next_chapter().unwrap();
            let pages: Vec<_> = (0..index.ring.geometry.pages_per_chapter())
                .map(|_| index.store.page_new().unwrap())
                .collect();
            index.write_chapter(virt, &pages, &entries).unwrap();
        }

        let report = index.convert_to_lvm(4096).unwrap();
        assert_eq!(index.ring.geometry.chapters_per_volume, 3);
        index.close().unwrap();

        let (reopened, _) = OpenIndex::open(&name, dir.path().join("state")).unwrap();
        assert_eq!(reopened.ring.geometry.chapters_per_volume, 3);
        assert_eq!(
            reopened.ring.geometry.map_to_physical(report.remapped_virtual),
            report.remapped_physical
        );
    }
}
