use flintdb::schema::{Column, ColumnType, Meta, Value};
use flintdb::storage::StorageOptions;
use flintdb::{HashTable, OpenMode, Row};
use test_log::test;

const BLOCK_DATA: usize = 64;
const BLOCK_BYTES: usize = 16 + BLOCK_DATA;

#[test]
fn long_payload_chains_and_reassembles() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = StorageOptions::new(dir.path().join("chain.db"))
        .block_data_bytes(BLOCK_DATA)
        .increment((BLOCK_BYTES * 8) as u64)
        .open()?;

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
    let id = store.write(&payload)?;

    assert_eq!(Some(payload), store.read(id)?);
    assert_eq!(1, store.count());
    store.close()?;

    // The on-disk layout is part of the contract: the head block is
    // marked 'D', continuations 'N', and the final block ends the chain
    // with next == -1
    let raw = std::fs::read(dir.path().join("chain.db"))?;
    let block_at = |i: usize| &raw[512 + i * BLOCK_BYTES..512 + (i + 1) * BLOCK_BYTES];

    let head = block_at(id as usize);
    assert_eq!(b'+', head[0]);
    assert_eq!(b'D', head[1]);

    let second = block_at(id as usize + 1);
    assert_eq!(b'+', second[0]);
    assert_eq!(b'N', second[1]);

    let chain_blocks = 4096usize.div_ceil(BLOCK_DATA);
    assert!(chain_blocks >= 2);

    let last = block_at(id as usize + chain_blocks - 1);
    let next = i64::from_le_bytes(last[8..16].try_into().expect("8 bytes"));
    assert_eq!(-1, next);

    Ok(())
}

#[test]
fn wide_string_rows_overflow_their_blocks() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;

    let meta = Meta::new(
        "wide",
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("body", ColumnType::String).with_width(8192),
        ],
        &["id"],
    )?;

    // row_bytes exceeds the compaction size, so rows chain across blocks
    assert_eq!(4_000, meta.block_data_bytes());

    let mut table = HashTable::open(dir.path().join("wide.db"), meta, OpenMode::ReadWrite)?;

    let body: String = ('a'..='z').cycle().take(4096).collect();
    let mut row = Row::new(vec![Value::Int64(1), Value::Str(body.clone())]);
    let id = table.apply(&mut row)?;

    let read = table.read(id)?.expect("row exists");
    assert_eq!(Some(&Value::Str(body)), read.get(1));

    table.close()?;
    Ok(())
}

#[test]
fn empty_and_block_sized_payloads_round_trip() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = StorageOptions::new(dir.path().join("edges.db"))
        .block_data_bytes(BLOCK_DATA)
        .open()?;

    for len in [0, 1, BLOCK_DATA - 1, BLOCK_DATA, BLOCK_DATA + 1, BLOCK_DATA * 3] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();
        let id = store.write(&payload)?;
        assert_eq!(Some(payload), store.read(id)?, "len {len}");
    }

    store.close()?;
    Ok(())
}
