use std::collections::HashSet;
use std::fs;

use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use trust_broker::{
    backing::{MemoryBacking, PsFile, StoreHandle},
    config::FlushPolicy,
    record::{HANDLE_LEN, Handle, KeyRecord, Layout, ROOT_HANDLE},
    store::{KeyStore, StoreError},
};

fn handle(n: u16) -> Handle {
    let mut bytes = [0xC3; HANDLE_LEN];
    bytes[..2].copy_from_slice(&n.to_be_bytes());
    Handle(bytes)
}

/// Hand-assembled record bytes, independent of the encoder.
fn raw_record(record: &KeyRecord, layout: Layout) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(record.handle.as_bytes());
    out.extend_from_slice(record.parent.as_bytes());
    out.extend_from_slice(&(record.public_blob.len() as u16).to_le_bytes());
    out.extend_from_slice(&(record.private_blob.len() as u16).to_le_bytes());
    if layout == Layout::Versioned {
        out.extend_from_slice(&(record.vendor_blob.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(&record.cache_flags.to_le_bytes());
    out.extend_from_slice(&record.public_blob);
    out.extend_from_slice(&record.private_blob);
    if layout == Layout::Versioned {
        out.extend_from_slice(&record.vendor_blob);
    }
    out
}

fn raw_file(records: &[KeyRecord], layout: Layout) -> Vec<u8> {
    let mut out = Vec::new();
    if layout == Layout::Versioned {
        out.push(0x01);
    }
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        out.extend(raw_record(record, layout));
    }
    out
}

#[test]
fn legacy_file_round_trips_byte_for_byte() -> Result<()> {
    let records = [
        KeyRecord::new(handle(2), handle(1)).with_private(vec![9; 12]),
        KeyRecord::new(handle(1), ROOT_HANDLE)
            .with_public(vec![1; 5])
            .with_cache_flags(0x8001),
        KeyRecord::new(handle(3), ROOT_HANDLE),
    ];
    let bytes = raw_file(&records, Layout::Legacy);

    let store = KeyStore::load_bytes(&bytes)?;
    assert_eq!(store.layout(), Layout::Legacy);
    assert_eq!(store.records(), &records[..]);
    assert_eq!(store.to_bytes()?, bytes);
    Ok(())
}

#[test]
fn versioned_file_round_trips_byte_for_byte() -> Result<()> {
    let records = [
        KeyRecord::new(ROOT_HANDLE, ROOT_HANDLE).with_public(vec![0xEE; 30]),
        KeyRecord::new(handle(1), ROOT_HANDLE)
            .with_public(vec![1, 2])
            .with_private(vec![3, 4, 5])
            .with_vendor(vec![6; 7]),
    ];
    let bytes = raw_file(&records, Layout::Versioned);

    let store = KeyStore::load_bytes(&bytes)?;
    assert_eq!(store.layout(), Layout::Versioned);
    assert_eq!(store.lookup(&handle(1)), Some(&records[1]));

    let mut persisted = Vec::new();
    store.persist(&mut persisted)?;
    assert_eq!(persisted, bytes);
    Ok(())
}

#[test]
fn hierarchy_lifecycle_ends_in_empty_store() -> Result<()> {
    let (r, a, b) = (handle(0x10), handle(0x20), handle(0x30));
    let mut store = KeyStore::new(Layout::Legacy);

    store.insert(KeyRecord::new(r, ROOT_HANDLE))?;
    store.insert(KeyRecord::new(a, r))?;
    store.insert(KeyRecord::new(b, a))?;

    assert!(matches!(
        store.remove(&r),
        Err(StoreError::HasChildren { children: 1, .. })
    ));
    assert!(matches!(
        store.remove(&a),
        Err(StoreError::HasChildren { children: 1, .. })
    ));
    store.remove(&b)?;
    store.remove(&a)?;
    store.remove(&r)?;
    assert!(matches!(store.remove(&r), Err(StoreError::UnknownHandle(_))));

    assert!(store.is_empty());
    assert_eq!(store.to_bytes()?, vec![0, 0, 0, 0]);
    Ok(())
}

/// A forest of `size` keys where every parent precedes its children.
fn random_forest(rng: &mut impl Rng, size: u16) -> Vec<KeyRecord> {
    let mut records: Vec<KeyRecord> = Vec::new();
    for n in 1..=size {
        let parent = if records.is_empty() || rng.gen_bool(0.25) {
            ROOT_HANDLE
        } else {
            records[rng.gen_range(0..records.len())].handle
        };
        let blob_len = rng.gen_range(0..64);
        records.push(KeyRecord::new(handle(n), parent).with_public(vec![n as u8; blob_len]));
    }
    records
}

#[test]
fn random_forests_keep_their_invariants() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(0x7D5);
    for _ in 0..20 {
        let size = rng.gen_range(1..40);
        let forest = random_forest(&mut rng, size);

        // Insert in a random order that still respects parents.
        let mut pending = forest.clone();
        pending.shuffle(&mut rng);
        let mut store = KeyStore::new(Layout::Legacy);
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|record| record.parent.is_root() || store.contains(&record.parent))
                .expect("a forest always has an insertable record");
            store.insert(pending.swap_remove(ready))?;
        }

        for record in &forest {
            assert_eq!(store.lookup(&record.handle), Some(record));
        }

        let parents: HashSet<Handle> = forest.iter().map(|record| record.parent).collect();
        for record in &forest {
            if parents.contains(&record.handle) {
                assert!(matches!(
                    store.clone().remove(&record.handle),
                    Err(StoreError::HasChildren { .. })
                ));
            } else {
                let mut pruned = store.clone();
                pruned.remove(&record.handle)?;
                assert_eq!(pruned.len(), store.len() - 1);
            }
        }

        let reloaded = KeyStore::load_bytes(&store.to_bytes()?)?;
        assert_eq!(reloaded.records(), store.records());
    }
    Ok(())
}

#[test]
fn store_file_survives_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(format!("system-{}.data", nanoid::nanoid!(8)));

    {
        let mut file = PsFile::open(&path)?;
        let store = StoreHandle::new(file.load()?, file, FlushPolicy::WriteThrough);
        store.register(KeyRecord::new(handle(1), ROOT_HANDLE).with_private(vec![5; 9]))?;
        store.register(KeyRecord::new(handle(2), handle(1)))?;
        store.unregister(&handle(2))?;
    }

    let mut file = PsFile::open(&path)?;
    let store = file.load()?;
    assert_eq!(store.len(), 1);
    assert_eq!(store.lookup(&handle(1)).map(|r| r.private_blob.len()), Some(9));
    assert_eq!(fs::read(&path)?, store.to_bytes()?);
    Ok(())
}

#[test]
fn emptied_versioned_store_accepts_new_top_level_keys() -> Result<()> {
    let root = KeyRecord::new(ROOT_HANDLE, ROOT_HANDLE).with_public(vec![0xEE; 8]);
    let bytes = raw_file(std::slice::from_ref(&root), Layout::Versioned);
    let backing = MemoryBacking::new();
    let store = StoreHandle::new(
        KeyStore::load_bytes(&bytes)?,
        backing.clone(),
        FlushPolicy::WriteThrough,
    );
    assert_eq!(store.layout(), Layout::Versioned);

    store.unregister(&ROOT_HANDLE)?;
    assert_eq!(backing.contents(), vec![0, 0, 0, 0]);
    assert_eq!(store.layout(), Layout::Legacy);

    // The running daemon and a restarted one must agree.
    let top = KeyRecord::new(Handle([7; HANDLE_LEN]), ROOT_HANDLE);
    store.register(top.clone())?;
    let reloaded = KeyStore::load_bytes(&backing.contents())?;
    assert_eq!(reloaded.layout(), Layout::Legacy);
    assert_eq!(reloaded.lookup(&top.handle), Some(&top));
    Ok(())
}

#[test]
fn failed_write_through_leaves_memory_unchanged() -> Result<()> {
    use std::io;
    use trust_broker::backing::StoreBacking;

    struct Broken;
    impl StoreBacking for Broken {
        fn replace(&mut self, _: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    let store = StoreHandle::new(KeyStore::new(Layout::Legacy), Broken, FlushPolicy::WriteThrough);
    let err = store
        .register(KeyRecord::new(handle(1), ROOT_HANDLE))
        .unwrap_err();
    assert!(matches!(err, StoreError::WriteFailed(_)));
    assert!(store.is_empty());
    assert!(store.lookup(&handle(1)).is_none());
    Ok(())
}
