use flintdb::index::{HashIndexFile, KeyOrder, KeyProbe, INTERNAL_MAX, LEAF_MAX};
use std::cmp::Ordering;
use test_log::test;

/// Every key lands in the same bucket; ordering is by raw key value.
struct OneBucket;

impl KeyOrder for OneBucket {
    fn hash_of(&mut self, _key: i64) -> flintdb::Result<u64> {
        Ok(0xDEAD)
    }

    fn compare(&mut self, a: i64, b: i64) -> flintdb::Result<Ordering> {
        Ok(a.cmp(&b))
    }
}

struct OneBucketProbe(i64);

impl KeyProbe for OneBucketProbe {
    fn hash(&mut self) -> flintdb::Result<u64> {
        Ok(0xDEAD)
    }

    fn compare_to(&mut self, stored: i64) -> flintdb::Result<Ordering> {
        Ok(self.0.cmp(&stored))
    }
}

#[test]
fn one_hundred_colliding_keys() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut index = HashIndexFile::open(dir.path().join("c.i.0"), false, false)?;

    for k in 0..100 {
        assert!(index.insert(k, &mut OneBucket)?);
    }
    assert_eq!(100, index.count());

    for k in 0..100 {
        assert_eq!(Some(k), index.find(&mut OneBucketProbe(k))?, "find {k}");
    }
    assert_eq!(None, index.find(&mut OneBucketProbe(100))?);

    let mut seen = Vec::new();
    index.traverse(&mut |k| {
        seen.push(k);
        Ok(())
    })?;
    assert_eq!((0..100).collect::<Vec<i64>>(), seen);

    index.close()?;
    Ok(())
}

#[test]
fn bucket_chain_grows_past_one_internal() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut index = HashIndexFile::open(dir.path().join("c.i.0"), false, false)?;

    // More keys than one internal can index, forcing a second internal
    // into the bucket chain
    let keys = (INTERNAL_MAX * LEAF_MAX + LEAF_MAX) as i64;

    // Descending insertion order exercises front-of-leaf inserts
    for k in (0..keys).rev() {
        assert!(index.insert(k, &mut OneBucket)?, "insert {k}");
    }
    assert_eq!(keys as u64, index.count());

    let mut seen = Vec::new();
    index.traverse(&mut |k| {
        seen.push(k);
        Ok(())
    })?;

    // One globally sorted sequence across all internals of the bucket
    assert_eq!((0..keys).collect::<Vec<i64>>(), seen);

    for k in 0..keys {
        assert_eq!(Some(k), index.find(&mut OneBucketProbe(k))?, "find {k}");
    }

    index.close()?;
    Ok(())
}

#[test]
fn scrambled_inserts_end_up_sorted() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut index = HashIndexFile::open(dir.path().join("c.i.0"), false, false)?;

    let count = 257i64;
    let mut keys: Vec<i64> = (0..count).collect();

    // Deterministic shuffle
    for i in 0..keys.len() {
        let j = (i * 131 + 17) % keys.len();
        keys.swap(i, j);
    }

    for &k in &keys {
        index.insert(k, &mut OneBucket)?;
    }

    let mut seen = Vec::new();
    index.traverse(&mut |k| {
        seen.push(k);
        Ok(())
    })?;
    assert_eq!((0..count).collect::<Vec<i64>>(), seen);

    index.close()?;
    Ok(())
}
