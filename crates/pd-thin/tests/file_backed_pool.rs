#![forbid(unsafe_code)]
//! Pool metadata written through the block cache to an image file and
//! reopened from it.

use pd_block::{BlockCache, BlockDevice, ByteBlockDevice, FileByteDevice};
use pd_btree::WalkOptions;
use pd_thin::{BlockTime, Damage, MetadataRoots, ThinMetadata};
use pd_tm::{CoreSpaceMap, SpaceMap, TransactionManager};
use std::sync::Arc;

const BLOCK_SIZE: u32 = pd_types::MD_BLOCK_SIZE;
const NR_BLOCKS: u64 = 256;

fn open_image(path: &std::path::Path, sm: Arc<dyn SpaceMap>) -> TransactionManager {
    let file = FileByteDevice::open(path).expect("open image");
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("block device");
    let cache = BlockCache::new(dev, 32).expect("cache");
    TransactionManager::new(Arc::new(cache) as Arc<dyn BlockDevice>, sm).expect("tm")
}

#[test]
fn metadata_survives_reopen() {
    let image = tempfile::NamedTempFile::new().expect("tempfile");
    image
        .as_file()
        .set_len(u64::from(BLOCK_SIZE) * NR_BLOCKS)
        .expect("size image");

    let meta_sm = Arc::new(CoreSpaceMap::new(NR_BLOCKS));
    let data_sm = CoreSpaceMap::new(1024);

    let roots: MetadataRoots = {
        let tm = open_image(image.path(), Arc::clone(&meta_sm) as Arc<dyn SpaceMap>);
        tm.begin();
        let mut md = ThinMetadata::create(&tm, &data_sm).unwrap();
        md.create_thin(1, 1, 1).unwrap();
        for vblock in 0..300_u64 {
            md.insert_mapping(1, vblock, BlockTime::new(vblock + 10, 1)).unwrap();
        }
        md.create_snap(1, 2, 2, 2).unwrap();
        md.insert_mapping(2, 299, BlockTime::new(900, 2)).unwrap();
        tm.commit().unwrap();
        md.roots()
    };

    // Counts live in memory; the trees themselves come back from the file.
    let tm = open_image(image.path(), meta_sm as Arc<dyn SpaceMap>);
    let md = ThinMetadata::open(&tm, &data_sm, roots);
    assert_eq!(md.devices().unwrap(), vec![1, 2]);
    assert_eq!(md.device_details(1).unwrap().mapped_blocks, 300);
    assert_eq!(md.device_details(2).unwrap().snapshotted_time, 2);
    assert_eq!(md.lookup_mapping(1, 299).unwrap().block, 309);
    assert_eq!(md.lookup_mapping(2, 299).unwrap().block, 900);
    assert_eq!(md.mappings(2).unwrap().len(), 300);

    let mut damage: Vec<Damage> = Vec::new();
    md.check(&mut damage, WalkOptions::strict()).unwrap();
    assert!(damage.is_empty(), "unexpected damage: {damage:?}");
}

#[test]
fn read_only_image_rejects_writes() {
    let image = tempfile::NamedTempFile::new().expect("tempfile");
    image
        .as_file()
        .set_len(u64::from(BLOCK_SIZE) * 4)
        .expect("size image");
    let mut perms = std::fs::metadata(image.path()).unwrap().permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(image.path(), perms).unwrap();

    let file = FileByteDevice::open(image.path()).expect("open image");
    if file.is_writable() {
        // Running as a user that ignores file permissions.
        return;
    }
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).expect("block device");
    let tm = TransactionManager::new(
        Arc::new(dev) as Arc<dyn BlockDevice>,
        Arc::new(CoreSpaceMap::new(4)) as Arc<dyn SpaceMap>,
    )
    .expect("tm");
    let data_sm = CoreSpaceMap::new(4);
    assert!(ThinMetadata::create(&tm, &data_sm).is_err());
}
