use super::*;
use common::Config;
use tempfile::tempdir;

fn config() -> Config {
    Config::builder()
        .file_lock_timeout(std::time::Duration::from_millis(100))
        .build()
}

fn wal_config() -> Config {
    Config::builder()
        .wal(true)
        .file_lock_timeout(std::time::Duration::from_millis(100))
        .build()
}

fn filled_page(size: usize, seed: u8) -> Page {
    let mut page = Page::new(size);
    for i in 0..size {
        page.as_mut_slice()[i] = seed.wrapping_add(i as u8);
    }
    page
}

#[test]
fn allocate_update_read_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let a = dm.allocate(None).unwrap();
    let b = dm.allocate(Some(&filled_page(4096, 7))).unwrap();
    assert_eq!(a, common::PageId(2));
    assert_eq!(b, common::PageId(3));

    let mut page = Page::new(4096);
    dm.read(b, &mut page).unwrap();
    assert_eq!(page.get_u8(0), 7);

    let update = filled_page(4096, 40);
    dm.update(a, &update).unwrap();
    dm.read(a, &mut page).unwrap();
    assert_eq!(page.as_slice(), update.as_slice());
}

#[test]
fn read_out_of_bounds_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let mut page = Page::new(4096);
    assert!(matches!(
        dm.read(common::PageId(0), &mut page),
        Err(common::DbError::DataCorruption(_))
    ));
    assert!(matches!(
        dm.read(common::PageId(5), &mut page),
        Err(common::DbError::DataCorruption(_))
    ));
}

#[test]
fn freed_pages_are_reused_lowest_first() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let p2 = dm.allocate(None).unwrap();
    let _p3 = dm.allocate(None).unwrap();
    let _p4 = dm.allocate(None).unwrap();

    dm.free(p2).unwrap();
    assert_eq!(dm.allocate(None).unwrap(), p2);
    // Free list drained; the next allocation appends.
    assert_eq!(dm.allocate(None).unwrap(), common::PageId(5));
}

#[test]
fn allocation_picks_the_lowest_freed_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let p2 = dm.allocate(None).unwrap();
    let p3 = dm.allocate(None).unwrap();
    let p4 = dm.allocate(None).unwrap();

    // Freed out of order; reuse must still be lowest-first.
    dm.free(p4).unwrap();
    dm.free(p2).unwrap();
    dm.free(p3).unwrap();
    assert_eq!(dm.allocate(None).unwrap(), p2);
    assert_eq!(dm.allocate(None).unwrap(), p3);
    assert_eq!(dm.allocate(None).unwrap(), p4);
}

#[test]
fn checksum_round_trip_on_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let id = dm.allocate(Some(&filled_page(4096, 1))).unwrap();
    dm.commit().unwrap();
    assert!(dm.validate().unwrap());

    // A mutation after commit invalidates the stored checksum until the
    // next commit.
    dm.update(id, &filled_page(4096, 2)).unwrap();
    assert!(!dm.validate().unwrap());
    dm.commit().unwrap();
    assert!(dm.validate().unwrap());
}

#[test]
fn clean_close_and_reopen_preserves_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    {
        let dm = DirectDiskManager::create(&path, FileType::VariableColumn, &config()).unwrap();
        dm.allocate(Some(&filled_page(4096, 9))).unwrap();
        dm.close().unwrap();
    }

    let dm = DirectDiskManager::open(&path, &config()).unwrap();
    assert!(dm.opened_clean());
    assert_eq!(dm.file_type(), FileType::VariableColumn);
    assert_eq!(dm.pages(), 2);

    let mut page = Page::new(4096);
    dm.read(common::PageId(2), &mut page).unwrap();
    assert_eq!(page.get_u8(0), 9);
}

#[test]
fn unclean_close_triggers_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    {
        let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();
        dm.allocate(Some(&filled_page(4096, 3))).unwrap();
        dm.commit().unwrap();
        // Taint and then drop without close, simulating a crash.
        dm.allocate(None).unwrap();
        drop(dm);
    }

    let dm = DirectDiskManager::open(&path, &config()).unwrap();
    assert!(!dm.opened_clean());
    // The committed page survives.
    let mut page = Page::new(4096);
    dm.read(common::PageId(2), &mut page).unwrap();
    assert_eq!(page.get_u8(0), 3);
    dm.close().unwrap();
}

#[test]
fn second_open_fails_with_file_locked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    let err = DirectDiskManager::open(&path, &config()).unwrap_err();
    assert!(matches!(err, common::DbError::FileLocked(_)));
    drop(dm);
}

#[test]
fn garbage_file_is_fatal_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("junk.db");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();

    let err = DirectDiskManager::open(&path, &config()).unwrap_err();
    assert!(matches!(err, common::DbError::DataCorruption(_)));
}

#[test]
fn rollback_restores_header_counters() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = DirectDiskManager::create(&path, FileType::FixedColumn, &config()).unwrap();

    dm.allocate(None).unwrap();
    dm.commit().unwrap();
    assert_eq!(dm.pages(), 2);

    dm.allocate(None).unwrap();
    dm.allocate(None).unwrap();
    assert_eq!(dm.pages(), 4);
    dm.rollback().unwrap();
    assert_eq!(dm.pages(), 2);
}

#[test]
fn wal_reads_its_own_uncommitted_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = WalDiskManager::create(&path, FileType::FixedColumn, &wal_config()).unwrap();

    let id = dm.allocate(Some(&filled_page(4096, 5))).unwrap();
    let mut page = Page::new(4096);
    dm.read(id, &mut page).unwrap();
    assert_eq!(page.get_u8(0), 5);

    dm.update(id, &filled_page(4096, 6)).unwrap();
    dm.read(id, &mut page).unwrap();
    assert_eq!(page.get_u8(0), 6);
}

#[test]
fn wal_rollback_discards_log_and_overlay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    let dm = WalDiskManager::create(&path, FileType::FixedColumn, &wal_config()).unwrap();

    let id = dm.allocate(Some(&filled_page(4096, 5))).unwrap();
    dm.commit().unwrap();

    dm.update(id, &filled_page(4096, 99)).unwrap();
    dm.rollback().unwrap();

    let mut page = Page::new(4096);
    dm.read(id, &mut page).unwrap();
    assert_eq!(page.get_u8(0), 5);
}

#[test]
fn wal_commit_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    {
        let dm = WalDiskManager::create(&path, FileType::FixedColumn, &wal_config()).unwrap();
        dm.allocate(Some(&filled_page(4096, 11))).unwrap();
        dm.commit().unwrap();
        dm.close().unwrap();
    }

    let dm = WalDiskManager::open(&path, &wal_config()).unwrap();
    assert!(dm.opened_clean());
    let mut page = Page::new(4096);
    dm.read(common::PageId(2), &mut page).unwrap();
    assert_eq!(page.get_u8(0), 11);
    assert!(dm.validate().unwrap());
}

#[test]
fn wal_uncommitted_tail_is_lost_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("col.db");
    {
        let dm = WalDiskManager::create(&path, FileType::FixedColumn, &wal_config()).unwrap();
        dm.allocate(Some(&filled_page(4096, 11))).unwrap();
        dm.commit().unwrap();
        dm.allocate(Some(&filled_page(4096, 12))).unwrap();
        drop(dm); // crash without commit: the log tail is never marked
    }

    let dm = WalDiskManager::open(&path, &wal_config()).unwrap();
    assert_eq!(dm.pages(), 2);
    let mut page = Page::new(4096);
    dm.read(common::PageId(2), &mut page).unwrap();
    assert_eq!(page.get_u8(0), 11);
}

#[test]
fn factory_picks_variant_from_config() {
    let dir = tempdir().unwrap();
    let direct = create_disk_manager(&dir.path().join("a.db"), FileType::Index, &config()).unwrap();
    assert_eq!(direct.file_type(), FileType::Index);
    let wal = create_disk_manager(&dir.path().join("b.db"), FileType::Index, &wal_config()).unwrap();
    wal.allocate(None).unwrap();
    wal.commit().unwrap();
    assert!(wal.validate().unwrap());
}
