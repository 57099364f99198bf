use flintdb::schema::{Column, ColumnType, Meta, Value};
use flintdb::{HashTable, OpenMode, Row};
use rand::Rng;
use test_log::test;

const ROW_COUNT: i64 = 1_000;

fn meta() -> flintdb::Result<Meta> {
    Meta::new(
        "events",
        vec![
            Column::new("id", ColumnType::Int64),
            Column::new("label", ColumnType::String).with_width(24),
            Column::new("weight", ColumnType::Double),
        ],
        &["id"],
    )
}

#[test]
fn reopen_read_only_sees_everything() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.db");
    let meta = meta()?;

    {
        let mut table = HashTable::open(&path, meta.clone(), OpenMode::ReadWrite)?;

        for i in 0..ROW_COUNT {
            let mut row = Row::new(vec![
                Value::Int64(i),
                Value::Str(format!("event-{i}")),
                Value::Double(i as f64 / 8.0),
            ]);
            table.apply(&mut row)?;
            assert_eq!(i, row.id);
        }

        assert_eq!(ROW_COUNT as u64, table.count());
        table.close()?;
    }

    {
        let mut table = HashTable::open(&path, meta, OpenMode::ReadOnly)?;
        assert_eq!(ROW_COUNT as u64, table.count());
        assert_eq!(OpenMode::ReadOnly, table.mode());

        let mut rng = rand::rng();

        for _ in 0..64 {
            let i = rng.random_range(0..ROW_COUNT);

            let row = table.read(i)?.expect("sampled row exists");
            assert_eq!(Some(&Value::Int64(i)), row.get(0));
            assert_eq!(Some(&Value::Str(format!("event-{i}"))), row.get(1));

            let hit = table
                .one(0, &[("id", Value::Int64(i))])?
                .expect("sampled key resolves");
            assert_eq!(i, hit.id);
        }

        table.close()?;
    }

    Ok(())
}

#[test]
fn reopen_via_sidecar_schema() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.db");

    {
        let mut table = HashTable::open(&path, meta()?, OpenMode::ReadWrite)?;
        let mut row = Row::new(vec![
            Value::Int64(5),
            Value::Str("only".into()),
            Value::Null,
        ]);
        table.apply(&mut row)?;
        table.close()?;
    }

    {
        // No schema in hand: the sidecar provides it
        let mut table = HashTable::open_existing(&path, OpenMode::ReadWrite)?;
        assert_eq!(1, table.count());
        assert_eq!("events", table.meta().name);

        let row = table
            .one(0, &[("id", Value::Int64(5))])?
            .expect("row survives");
        assert_eq!(Some(&Value::Str("only".into())), row.get(1));

        table.close()?;
    }

    Ok(())
}

#[test]
fn reopen_keeps_upserts_not_duplicates() -> flintdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.db");
    let meta = meta()?;

    {
        let mut table = HashTable::open(&path, meta.clone(), OpenMode::ReadWrite)?;
        for i in 0..50 {
            let mut row = Row::new(vec![
                Value::Int64(i % 10),
                Value::Str(format!("pass-{i}")),
                Value::Null,
            ]);
            table.apply(&mut row)?;
        }
        assert_eq!(10, table.count());
        table.close()?;
    }

    {
        let mut table = HashTable::open(&path, meta, OpenMode::ReadWrite)?;
        assert_eq!(10, table.count());

        // Upserting across a reopen still finds the old keys
        let mut row = Row::new(vec![
            Value::Int64(3),
            Value::Str("final".into()),
            Value::Null,
        ]);
        table.apply(&mut row)?;
        assert_eq!(10, table.count());

        let hit = table
            .one(0, &[("id", Value::Int64(3))])?
            .expect("key 3 exists");
        assert_eq!(Some(&Value::Str("final".into())), hit.get(1));

        table.close()?;
    }

    Ok(())
}
