//! The convert-to-LVM in-place shrink operation. Evicts (or relocates)
//! exactly one chapter so the device's front can be handed to LVM
//! metadata.

use std::path::Path;

use crate::assertions::ensure_invariant;
use crate::chapter_ring::ChapterRing;
use crate::chapter_ring::ExpirePolicy;
use crate::error::{Error, Result};
use crate::geometry::RemappedChapter;
use crate::index_state::IndexState;
use crate::layout::Layout;
use crate::volume_store::VolumeStore;

const COMPONENT_GEOMETRY: &str = "geometry";
const COMPONENT_PAGE_MAP: &str = "page_map";
const COMPONENT_RING_BOUNDS: &str = "ring_bounds";

pub struct ConvertReport {
    pub bytes_per_chapter: u64,
    pub remapped_virtual: u64,
    pub remapped_physical: u32,
}

/// Runs on a fully quiescent, single-zone, already-open index; the
/// caller owns opening and closing the session around this call.
pub fn convert_to_lvm(
    layout: &mut Layout,
    ring: &mut ChapterRing,
    store: &VolumeStore,
    state: &IndexState,
    freed_space_bytes: u64,
) -> Result<ConvertReport> {
    let report = apply_convert_to_lvm(layout, ring, store, freed_space_bytes)?;
    force_save(ring, state)?;
    Ok(report)
}

/// Steps 1-7: evicts/relocates the one chapter and rewrites the
/// super-block, but does not touch the save-ring (step 8). Split out
/// from `convert_to_lvm` so a crash in the window between the
/// super-block rewrite and the forced save can be reproduced directly:
/// call this, then inspect or repair the on-disk state without the
/// save ever having happened.
pub fn apply_convert_to_lvm(
    layout: &mut Layout,
    ring: &mut ChapterRing,
    store: &VolumeStore,
    freed_space_bytes: u64,
) -> Result<ConvertReport> {
    if freed_space_bytes == 0 || freed_space_bytes % 4096 != 0 {
        return Err(Error::InvalidArgument(format!(
            "freed_space_bytes {freed_space_bytes} must be a positive multiple of 4096"
        )));
    }
    let bytes_per_chapter = ring.geometry.bytes_per_chapter();
    if freed_space_bytes > bytes_per_chapter {
        return Err(Error::InvalidArgument(format!(
            "freed_space_bytes {freed_space_bytes} exceeds bytes_per_chapter {bytes_per_chapter}"
        )));
    }

    let chapters_per_volume = ring.geometry.chapters_per_volume;
    ensure_invariant!(
        chapters_per_volume >= 2,
        "convert_to_lvm needs at least two chapters, have {chapters_per_volume}"
    );

    let newest = ring
        .newest()
        .ok_or_else(|| Error::InvalidArgument("cannot convert an empty index".into()))?;

    // Step 2: if the ring is already at capacity, force-expire the
    // oldest chapter so step 5's relocation always has somewhere to
    // land. This only ever moves `oldest`; `newest` (used below) is
    // unaffected.
    if (newest - ring.oldest()) as i128 > chapters_per_volume as i128 - 2 {
        ring.expire_chapter(ring.oldest(), ExpirePolicy::Expire)?;
    }

    // Step 3.
    let mut remapped_virtual = newest - (newest % chapters_per_volume as u64);
    let mut new_physical = ((newest + 1) % chapters_per_volume as u64) as u32;

    // Step 4: shadow-update the index page map ahead of the data copy.
    if new_physical > 0 {
        ring.page_map.copy_slot(0, new_physical);
    }
    ring.page_map.shift_down(1);

    // Step 5.
    if new_physical == 0 {
        remapped_virtual += chapters_per_volume as u64;
        new_physical = 1;
    } else {
        ring.relocate_chapter(store, 0, new_physical)?;
        store.sync()?;
    }

    // Step 6.
    let new_chapters_per_volume = chapters_per_volume - 1;
    let remapped_physical = new_physical - 1;
    ring.page_map.truncate_chapters(new_chapters_per_volume);

    ring.geometry.chapters_per_volume = new_chapters_per_volume;
    ring.geometry.remap = Some(RemappedChapter {
        virtual_chapter: remapped_virtual,
        physical_slot: remapped_physical,
    });

    ensure_invariant!(
        ring.geometry.map_to_physical(remapped_virtual) == remapped_physical,
        "post-convert geometry does not map remapped_virtual {remapped_virtual} to \
         remapped_physical {remapped_physical}"
    );

    // Step 7: rewrite the super-block. Nothing above this point has
    // touched disk except the (idempotent) relocation copy, so a
    // failure here leaves a valid, unconverted layout. A crash right
    // after this point is exactly the window `force_save` below and
    // `repair_layout` exist for: the super-block now claims
    // `freed_space_bytes` more offset than the still-unsaved,
    // pre-convert open-chapter metadata expects.
    let mut new_config = layout.super_block.index_config.clone();
    new_config.chapters_per_volume = new_chapters_per_volume;
    new_config.remap = ring.geometry.remap;
    layout.update_layout(new_config, freed_space_bytes, bytes_per_chapter)?;

    Ok(ConvertReport {
        bytes_per_chapter,
        remapped_virtual,
        remapped_physical,
    })
}

/// Step 8: force a save even though no request traffic occurred, so
/// the remap survives a close/reopen. Split out from
/// `apply_convert_to_lvm` so the crash window between step 7 and this
/// call can be reproduced in isolation.
pub fn force_save(ring: &ChapterRing, state: &IndexState) -> Result<()> {
    state.prepare_save()?;
    state.write_component(COMPONENT_GEOMETRY, &ring.geometry.encode())?;
    state.write_component(COMPONENT_PAGE_MAP, &ring.page_map.encode())?;
    state.write_component(COMPONENT_RING_BOUNDS, &ring.encode_bounds())?;
    state.commit_save(false)
}

/// `udsRepairConvertToLVM`: thin re-export under this component's name.
/// The actual patch (rewrite only `start_offset_bytes`) lives in
/// layout.rs since it operates directly on an unopened super-block.
pub fn repair_convert_to_lvm(path: &Path, index_offset: u64, new_start_offset: u64) -> Result<()> {
    crate::layout::repair_layout(path, index_offset, new_start_offset)
}
