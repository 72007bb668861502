use chapterstore::chapter_ring::PageMapEntry;
use chapterstore::{Geometry, IndexConfig, OpenIndex};

fn main() -> chapterstore::Result<()> {
    let data_dir = "./chapterstore_data";
    std::fs::create_dir_all(data_dir).ok();
    let vol_path = format!("{data_dir}/volume.idx");
    let _ = std::fs::remove_file(&vol_path);
    let _ = std::fs::remove_dir_all(format!("{data_dir}/state"));

    println!("--- chapterstore smoke test ---");

    let geometry = Geometry::new(4096, 32, 4, 16, 0)?;
    let config = IndexConfig {
        mem: 1,
        checkpoint_frequency: 16,
        sparse: false,
        remap: None,
        chapters_per_volume: geometry.chapters_per_volume,
        start_offset_bytes: 0,
    };

    println!("formatting index at {vol_path}");
    let mut index = OpenIndex::format(
        &format!("file={vol_path}"),
        config,
        geometry,
        format!("{data_dir}/state"),
    )?;

    let entries = vec![PageMapEntry::default(); index.ring.geometry.entries_per_chapter() as usize];
    for chapter in 0..4u64 {
        let virt = index.ring.allocate_next_chapter()?;
        let pages: Vec<_> = (0..index.ring.geometry.pages_per_chapter())
            .map(|_| {
                let mut page = index.store.page_new().unwrap();
                page.as_mut_slice().fill(chapter as u8);
                page
            })
            .collect();
        println!("writing chapter {virt}");
        index.write_chapter(virt, &pages, &entries)?;
    }
    index.save(false)?;

    println!("reading chapter 2 back");
    let read_back = index.read_chapter(2)?;
    assert!(read_back.iter().all(|p| p.as_slice().iter().all(|&b| b == 2)));

    println!("running convert-to-lvm (freed_space=4096)");
    let report = index.convert_to_lvm(4096)?;
    println!(
        "converted: chapters_per_volume={} remapped_virtual={} remapped_physical={}",
        index.ring.geometry.chapters_per_volume, report.remapped_virtual, report.remapped_physical
    );

    index.close()?;

    let (reopened, needs_replay) = OpenIndex::open(&format!("file={vol_path}"), format!("{data_dir}/state"))?;
    println!(
        "reopened: chapters_per_volume={} needs_replay={needs_replay}",
        reopened.ring.geometry.chapters_per_volume
    );
    reopened.close()?;

    println!("--- smoke test passed ---");
    Ok(())
}
