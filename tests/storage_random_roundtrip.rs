use flintdb::storage::StorageOptions;
use rand::Rng;
use std::collections::HashMap;
use test_log::test;

const BLOCK_DATA: usize = 128;

#[test]
fn random_payloads_round_trip() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = StorageOptions::new(dir.path().join("rand.db"))
        .block_data_bytes(BLOCK_DATA)
        .open()?;

    let mut rng = rand::rng();
    let mut expected: HashMap<u64, Vec<u8>> = HashMap::new();

    for _ in 0..200 {
        let len = rng.random_range(0..BLOCK_DATA * 5);
        let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();

        let id = store.write(&payload)?;
        expected.insert(id, payload);
    }

    for (id, payload) in &expected {
        assert_eq!(Some(payload.clone()), store.read(*id)?, "row {id}");
    }
    assert_eq!(expected.len() as u64, store.count());

    store.close()?;
    Ok(())
}

#[test]
fn random_overwrites_and_deletes_stay_consistent() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = StorageOptions::new(dir.path().join("churn.db"))
        .block_data_bytes(BLOCK_DATA)
        .open()?;

    let mut rng = rand::rng();
    let mut expected: HashMap<u64, Vec<u8>> = HashMap::new();

    for _ in 0..100 {
        let payload: Vec<u8> = (0..rng.random_range(1..BLOCK_DATA * 3))
            .map(|_| rng.random())
            .collect();
        let id = store.write(&payload)?;
        expected.insert(id, payload);
    }

    for round in 0..300 {
        let ids: Vec<u64> = expected.keys().copied().collect();
        let id = ids[rng.random_range(0..ids.len())];

        if round % 3 == 0 {
            assert!(store.delete(id)?, "delete {id}");
            expected.remove(&id);

            let payload: Vec<u8> = (0..rng.random_range(1..BLOCK_DATA * 3))
                .map(|_| rng.random())
                .collect();
            let fresh = store.write(&payload)?;
            expected.insert(fresh, payload);
        } else {
            let payload: Vec<u8> = (0..rng.random_range(1..BLOCK_DATA * 4))
                .map(|_| rng.random())
                .collect();
            store.write_at(id, &payload)?;
            expected.insert(id, payload);
        }
    }

    for (id, payload) in &expected {
        assert_eq!(Some(payload.clone()), store.read(*id)?, "row {id}");
    }
    assert_eq!(expected.len() as u64, store.count());

    store.close()?;
    Ok(())
}

#[test]
fn state_survives_many_reopen_cycles() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cycles.db");
    let mut expected: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut rng = rand::rng();

    for cycle in 0..5 {
        let mut store = StorageOptions::new(&path)
            .block_data_bytes(BLOCK_DATA)
            .open()?;

        for (id, payload) in &expected {
            assert_eq!(
                Some(payload.clone()),
                store.read(*id)?,
                "cycle {cycle}, row {id}"
            );
        }

        for _ in 0..50 {
            let payload: Vec<u8> = (0..rng.random_range(1..BLOCK_DATA * 2))
                .map(|_| rng.random())
                .collect();
            let id = store.write(&payload)?;
            expected.insert(id, payload);
        }

        assert_eq!(expected.len() as u64, store.count());
        store.close()?;
    }

    Ok(())
}
