//! A chapter-based deduplication index storage engine: a page-granular
//! volume store, an on-disk super-block/region layout, a four-slot
//! save-ring directory protocol, a virtual-to-physical chapter ring
//! with its index-page-map shadow, the convert-to-LVM in-place shrink
//! operation, and an adaptive-batching request queue.

pub mod assertions;
pub mod chapter_ring;
pub mod convert;
pub mod error;
pub mod geometry;
pub mod index;
pub mod index_state;
pub mod layout;
pub mod page;
pub mod queue;
pub mod region;
pub mod volume_store;

pub use chapter_ring::{ChapterRing, ExpirePolicy, IndexPageMap, PageMapEntry};
pub use convert::{convert_to_lvm, repair_convert_to_lvm, ConvertReport};
pub use error::{Error, Result};
pub use geometry::{Geometry, RemappedChapter};
pub use index::OpenIndex;
pub use index_state::{DiscardMode, IndexState};
pub use layout::{IndexConfig, Layout, LayoutName, Region, SuperBlock, DATA_REGION, INDEX_REGION};
pub use page::AlignedBuf;
pub use queue::{Request, RequestQueue};
pub use region::ByteRegion;
pub use volume_store::VolumeStore;
