//! The index-name grammar, the on-disk super-block, and the region
//! table that resolves logical sub-regions to absolute byte offsets.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::geometry::{Geometry, RemappedChapter};
use crate::region::{pread_exact, pwrite_exact, ByteRegion};

pub const INDEX_REGION: u32 = 0;
pub const DATA_REGION: u32 = 1;

const MAGIC: &[u8; 8] = b"UDSLYT01";
const SUPPORTED_VERSIONS: &[u32] = &[1];
const PAGE_MAP_ENTRY_BYTES: u64 = 12; // u32 delta-list terminator + u64 boundary key
const NO_REMAP: u64 = u64::MAX;

/// One `key=value` pair from an index-name string, or a bare path
/// defaulting to `file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutName {
    pub file: PathBuf,
    pub size: u64,
    pub offset: u64,
}

impl LayoutName {
    pub fn parse(name: &str) -> Result<Self> {
        let mut file: Option<PathBuf> = None;
        let mut size: u64 = 0;
        let mut offset: u64 = 0;

        for token in name.split([',', ' ']).map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => ("file", token),
            };
            match key {
                "file" => file = Some(PathBuf::from(value)),
                "size" => {
                    size = value
                        .parse()
                        .map_err(|_| Error::InvalidArgument(format!("bad size value: {value}")))?
                }
                "offset" => {
                    offset = value
                        .parse()
                        .map_err(|_| Error::InvalidArgument(format!("bad offset value: {value}")))?
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown index-name key: {other}"
                    )))
                }
            }
        }

        let file = file.ok_or_else(|| {
            Error::InvalidArgument("index name must resolve a `file` key".to_string())
        })?;
        Ok(Self { file, size, offset })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub id: u32,
    pub start_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub mem: u32,
    pub checkpoint_frequency: u32,
    pub sparse: bool,
    pub remap: Option<RemappedChapter>,
    pub chapters_per_volume: u32,
    pub start_offset_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u32,
    pub nonce: u64,
    pub uuid: [u8; 16],
    pub bio_offset: u64,
    pub regions: Vec<Region>,
    pub index_config: IndexConfig,
}

impl SuperBlock {
    fn region(&self, id: u32) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub fn index_region(&self) -> &Region {
        self.region(INDEX_REGION).expect("index region always present")
    }

    pub fn data_region(&self) -> &Region {
        self.region(DATA_REGION).expect("data region always present")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.uuid);
        buf.extend_from_slice(&self.bio_offset.to_le_bytes());
        buf.extend_from_slice(&(self.regions.len() as u32).to_le_bytes());
        for region in &self.regions {
            buf.extend_from_slice(&region.id.to_le_bytes());
            buf.extend_from_slice(&region.start_block.to_le_bytes());
        }
        buf.extend_from_slice(&self.index_config.mem.to_le_bytes());
        buf.extend_from_slice(&self.index_config.checkpoint_frequency.to_le_bytes());
        buf.push(self.index_config.sparse as u8);
        let (remapped_virtual, remapped_physical) = match self.index_config.remap {
            Some(r) => (r.virtual_chapter, r.physical_slot as u64),
            None => (0, NO_REMAP),
        };
        buf.extend_from_slice(&remapped_virtual.to_le_bytes());
        buf.extend_from_slice(&remapped_physical.to_le_bytes());
        buf.extend_from_slice(&self.index_config.chapters_per_volume.to_le_bytes());
        buf.extend_from_slice(&self.index_config.start_offset_bytes.to_le_bytes());

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf);
            hasher.finalize()
        };
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 + 4 + 8 + 16 + 8 + 4 {
            return Err(Error::CorruptData("super-block truncated".into()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::CorruptData("super-block magic mismatch".into()));
        }
        let mut at = 8usize;
        let read_u32 = |b: &[u8], at: &mut usize| -> u32 {
            let v = u32::from_le_bytes(b[*at..*at + 4].try_into().unwrap());
            *at += 4;
            v
        };
        let read_u64 = |b: &[u8], at: &mut usize| -> u64 {
            let v = u64::from_le_bytes(b[*at..*at + 8].try_into().unwrap());
            *at += 8;
            v
        };

        let version = read_u32(buf, &mut at);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(Error::CorruptData(format!(
                "unsupported super-block version {version}"
            )));
        }
        let nonce = read_u64(buf, &mut at);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[at..at + 16]);
        at += 16;
        let bio_offset = read_u64(buf, &mut at);
        let region_count = read_u32(buf, &mut at);
        if region_count < 2 {
            return Err(Error::CorruptData(format!(
                "region table has only {region_count} regions, need >= 2"
            )));
        }
        let mut regions = Vec::with_capacity(region_count as usize);
        for _ in 0..region_count {
            let id = read_u32(buf, &mut at);
            let start_block = read_u64(buf, &mut at);
            regions.push(Region { id, start_block });
        }
        for pair in regions.windows(2) {
            if pair[1].start_block <= pair[0].start_block {
                return Err(Error::CorruptData(
                    "region start blocks must be strictly increasing".into(),
                ));
            }
        }
        let by_id: HashMap<u32, &Region> = regions.iter().map(|r| (r.id, r)).collect();
        if !by_id.contains_key(&INDEX_REGION) || !by_id.contains_key(&DATA_REGION) {
            return Err(Error::CorruptData(
                "region table missing INDEX_REGION/DATA_REGION".into(),
            ));
        }

        let mem = read_u32(buf, &mut at);
        let checkpoint_frequency = read_u32(buf, &mut at);
        let sparse = buf[at] != 0;
        at += 1;
        let remapped_virtual = read_u64(buf, &mut at);
        let remapped_physical = read_u64(buf, &mut at);
        let chapters_per_volume = read_u32(buf, &mut at);
        let start_offset_bytes = read_u64(buf, &mut at);

        let stored_crc = read_u32(buf, &mut at);
        let computed_crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf[..at - 4]);
            hasher.finalize()
        };
        if stored_crc != computed_crc {
            return Err(Error::CorruptData("super-block CRC mismatch".into()));
        }

        let remap = if remapped_physical == NO_REMAP {
            None
        } else {
            Some(RemappedChapter {
                virtual_chapter: remapped_virtual,
                physical_slot: remapped_physical as u32,
            })
        };

        Ok(Self {
            version,
            nonce,
            uuid,
            bio_offset,
            regions,
            index_config: IndexConfig {
                mem,
                checkpoint_frequency,
                sparse,
                remap,
                chapters_per_volume,
                start_offset_bytes,
            },
        })
    }
}

pub struct Layout {
    pub name: LayoutName,
    file: Arc<File>,
    block_size: u64,
    layout_len: u64,
    pub super_block: SuperBlock,
}

fn block_size_of(file: &File) -> u64 {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ok = unsafe { libc::fstat(file.as_raw_fd(), &mut stat) } == 0;
    if ok && stat.st_blksize > 0 {
        stat.st_blksize as u64
    } else {
        4096
    }
}

impl Layout {
    /// Formats a brand-new device (`is_new = true`) or opens an
    /// existing one, reading back its persisted super-block. `geometry`
    /// supplies the page/chapter shape needed to size the index-page-map
    /// reservation; that reservation is always sized off the
    /// *pre-convert* chapter count the layout was created with.
    pub fn make_layout(
        name_str: &str,
        is_new: bool,
        config: &IndexConfig,
        geometry: &Geometry,
    ) -> Result<Self> {
        let name = LayoutName::parse(name_str)?;

        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true);
        if is_new {
            open_options.create(true);
        }
        let file = open_options
            .open(&name.file)
            .map_err(Error::Io)?;
        let block_size = block_size_of(&file);

        if is_new {
            let page_map_bytes =
                geometry.chapters_per_volume as u64 * geometry.entries_per_chapter() as u64 * PAGE_MAP_ENTRY_BYTES;
            let page_map_blocks = page_map_bytes.div_ceil(block_size).max(1);
            let index_region_start = 1u64;
            let data_region_start = index_region_start + page_map_blocks;

            let total_size = if name.size != 0 {
                name.size
            } else {
                let data_bytes = geometry.bytes_per_chapter() * geometry.chapters_per_volume as u64;
                data_region_start * block_size + data_bytes
            };
            file.set_len(name.offset + total_size).map_err(Error::Io)?;

            let mut rng = rand::thread_rng();
            let mut uuid = [0u8; 16];
            rng.fill_bytes(&mut uuid);

            let super_block = SuperBlock {
                version: 1,
                nonce: rng.next_u64(),
                uuid,
                bio_offset: 0,
                regions: vec![
                    Region {
                        id: INDEX_REGION,
                        start_block: index_region_start,
                    },
                    Region {
                        id: DATA_REGION,
                        start_block: data_region_start,
                    },
                ],
                index_config: IndexConfig {
                    mem: config.mem,
                    checkpoint_frequency: config.checkpoint_frequency,
                    sparse: config.sparse,
                    remap: None,
                    chapters_per_volume: geometry.chapters_per_volume,
                    start_offset_bytes: 0,
                },
            };

            let mut layout = Self {
                name,
                file: Arc::new(file),
                block_size,
                layout_len: total_size,
                super_block,
            };
            layout.write_super_block()?;
            Ok(layout)
        } else {
            let layout_len = file
                .metadata()
                .map_err(Error::Io)?
                .len()
                .checked_sub(name.offset)
                .ok_or_else(|| Error::CorruptData("layout offset exceeds file length".into()))?;
            let mut block = vec![0u8; block_size as usize];
            pread_exact(&file, &mut block, name.offset)?;
            let super_block = SuperBlock::decode(&block)?;

            let data_region = super_block.data_region();
            let index_region = super_block.index_region();
            if data_region.start_block * block_size > name.offset + layout_len {
                return Err(Error::CorruptData(
                    "DATA_REGION starts past the end of the device".into(),
                ));
            }
            if data_region.start_block < index_region.start_block {
                return Err(Error::CorruptData(
                    "DATA_REGION must start at or after INDEX_REGION".into(),
                ));
            }

            Ok(Self {
                name,
                file: Arc::new(file),
                block_size,
                layout_len,
                super_block,
            })
        }
    }

    fn write_super_block(&mut self) -> Result<()> {
        let encoded = self.super_block.encode();
        pwrite_exact(&self.file, &encoded, self.name.offset)?;
        self.file.sync_all().map_err(Error::Io)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn open_super_block_region(&self) -> ByteRegion {
        ByteRegion::new(Arc::clone(&self.file), self.name.offset, self.block_size)
    }

    pub fn open_page_map_region(&self) -> ByteRegion {
        let index_region = self.super_block.index_region();
        let data_region = self.super_block.data_region();
        let start = self.name.offset + index_region.start_block * self.block_size;
        let len = (data_region.start_block - index_region.start_block) * self.block_size;
        ByteRegion::new(Arc::clone(&self.file), start, len)
    }

    pub fn open_volume_region(&self) -> ByteRegion {
        let data_region = self.super_block.data_region();
        let start = self.name.offset + data_region.start_block * self.block_size;
        let len = (self.name.offset + self.layout_len).saturating_sub(start);
        ByteRegion::new(Arc::clone(&self.file), start, len)
    }

    pub fn file_for_stat(&self) -> &File {
        &self.file
    }

    /// Shifts `INDEX_REGION` forward by `freed_space_bytes` (the LVM
    /// metadata prefix now occupying the front of the device) and
    /// shifts `DATA_REGION` forward by the full `bytes_per_chapter`
    /// (the relocated chapter's old slot 0 is no longer part of the
    /// addressable ring, so the data region's usable span starts where
    /// the old slot 1 began).
    pub fn update_layout(
        &mut self,
        new_config: IndexConfig,
        freed_space_bytes: u64,
        bytes_per_chapter: u64,
    ) -> Result<()> {
        if freed_space_bytes == 0 || freed_space_bytes % 4096 != 0 {
            return Err(Error::InvalidArgument(format!(
                "freed_space_bytes {freed_space_bytes} must be a positive multiple of 4096"
            )));
        }
        if freed_space_bytes > bytes_per_chapter {
            return Err(Error::InvalidArgument(format!(
                "freed_space_bytes {freed_space_bytes} exceeds bytes_per_chapter {bytes_per_chapter}"
            )));
        }
        if freed_space_bytes % self.block_size != 0 || bytes_per_chapter % self.block_size != 0 {
            return Err(Error::InvalidArgument(
                "freed_space_bytes and bytes_per_chapter must be multiples of the block size".into(),
            ));
        }

        let index_region = *self.super_block.index_region();
        let data_region = *self.super_block.data_region();
        let new_index_start = index_region.start_block + freed_space_bytes / self.block_size;
        let new_data_start = data_region.start_block + bytes_per_chapter / self.block_size;

        crate::assertions::ensure_invariant!(
            new_data_start >= new_index_start,
            "update_layout would make DATA_REGION precede INDEX_REGION"
        );

        let mut new_config = new_config;
        new_config.start_offset_bytes += freed_space_bytes;

        self.super_block.regions = vec![
            Region {
                id: INDEX_REGION,
                start_block: new_index_start,
            },
            Region {
                id: DATA_REGION,
                start_block: new_data_start,
            },
        ];
        self.super_block.index_config = new_config;
        self.super_block.version += 1;

        self.write_super_block()
    }
}

/// Patches only `start_offset_bytes` in an existing on-disk
/// super-block, used to recover from a crash between `update_layout`
/// and the forced save that follows it.
pub fn repair_layout(path: &Path, index_offset: u64, new_start_offset: u64) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(Error::Io)?;
    let block_size = block_size_of(&file);
    let mut block = vec![0u8; block_size as usize];
    pread_exact(&file, &mut block, index_offset)?;
    let mut super_block = SuperBlock::decode(&block)?;
    super_block.index_config.start_offset_bytes = new_start_offset;
    let encoded = super_block.encode();
    pwrite_exact(&file, &encoded, index_offset)?;
    file.sync_all().map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    fn test_geometry() -> Geometry {
        Geometry::new(4096, 32, 4, 16, 0).unwrap()
    }

    fn test_config() -> IndexConfig {
        IndexConfig {
            mem: 1,
            checkpoint_frequency: 16,
            sparse: false,
            remap: None,
            chapters_per_volume: 16,
            start_offset_bytes: 0,
        }
    }

    #[test]
    fn parses_name_grammar() {
        let name = LayoutName::parse("file=/tmp/v, size=1024, offset=4096").unwrap();
        assert_eq!(name.file, PathBuf::from("/tmp/v"));
        assert_eq!(name.size, 1024);
        assert_eq!(name.offset, 4096);
    }

    #[test]
    fn bare_path_defaults_to_file_key() {
        let name = LayoutName::parse("/tmp/v").unwrap();
        assert_eq!(name.file, PathBuf::from("/tmp/v"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(LayoutName::parse("directory=/tmp/v").is_err());
    }

    #[test]
    fn format_then_open_round_trips_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.idx");
        let name_str = format!("file={}", path.display());

        let geometry = test_geometry();
        let config = test_config();
        let layout = Layout::make_layout(&name_str, true, &config, &geometry).unwrap();
        let nonce = layout.super_block.nonce;
        assert_eq!(layout.super_block.index_region().start_block, 1);
        drop(layout);

        let reopened = Layout::make_layout(&name_str, false, &config, &geometry).unwrap();
        assert_eq!(reopened.super_block.nonce, nonce);
        assert_eq!(reopened.super_block.index_config.chapters_per_volume, 16);
        assert_eq!(reopened.super_block.index_config.remap, None);
    }

    #[test]
    fn scenario_one_region_table_offsets() {
        // chapters=16, record_pages=32, index_pages=4, bytes_per_page=4096
        // -> index starts at block 1, data starts at
        // block 1 + ceil(index_size/4096).
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.idx");
        let name_str = format!("file={}", path.display());
        let geometry = test_geometry();
        let config = test_config();
        let layout = Layout::make_layout(&name_str, true, &config, &geometry).unwrap();

        let entries_per_chapter = geometry.entries_per_chapter() as u64;
        let page_map_bytes = geometry.chapters_per_volume as u64 * entries_per_chapter * PAGE_MAP_ENTRY_BYTES;
        let expected_blocks = page_map_bytes.div_ceil(4096).max(1);

        assert_eq!(layout.super_block.index_region().start_block, 1);
        assert_eq!(
            layout.super_block.data_region().start_block,
            1 + expected_blocks
        );
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.idx");
        let name_str = format!("file={}", path.display());
        let geometry = test_geometry();
        let config = test_config();
        let mut layout = Layout::make_layout(&name_str, true, &config, &geometry).unwrap();
        layout.super_block.version = 99;
        layout.write_super_block().unwrap();
        drop(layout);

        let err = Layout::make_layout(&name_str, false, &config, &geometry).unwrap_err();
        assert!(matches!(err, Error::CorruptData(_)));
    }

    #[test]
    fn update_layout_shifts_regions_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.idx");
        let name_str = format!("file={}", path.display());
        let geometry = test_geometry();
        let config = test_config();
        let mut layout = Layout::make_layout(&name_str, true, &config, &geometry).unwrap();

        let old_index_start = layout.super_block.index_region().start_block;
        let old_data_start = layout.super_block.data_region().start_block;
        let old_version = layout.super_block.version;

        let bytes_per_chapter = geometry.bytes_per_chapter();
        let mut new_config = layout.super_block.index_config.clone();
        new_config.chapters_per_volume -= 1;
        layout
            .update_layout(new_config, 4096, bytes_per_chapter)
            .unwrap();

        assert_eq!(
            layout.super_block.index_region().start_block,
            old_index_start + 1
        );
        assert_eq!(
            layout.super_block.data_region().start_block,
            old_data_start + bytes_per_chapter / 4096
        );
        assert_eq!(layout.super_block.version, old_version + 1);
        assert_eq!(layout.super_block.index_config.start_offset_bytes, 4096);
    }

    #[test]
    fn repair_patches_only_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.idx");
        let name_str = format!("file={}", path.display());
        let geometry = test_geometry();
        let config = test_config();
        let layout = Layout::make_layout(&name_str, true, &config, &geometry).unwrap();
        let version_before = layout.super_block.version;
        drop(layout);

        repair_layout(&path, 0, 4096).unwrap();

        let reopened = Layout::make_layout(&name_str, false, &config, &geometry).unwrap();
        assert_eq!(reopened.super_block.index_config.start_offset_bytes, 4096);
        assert_eq!(reopened.super_block.version, version_before);
    }
}
