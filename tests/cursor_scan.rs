//! # Cursor and Ordering Tests
//!
//! Lexicographic iteration, the partial-match seek contract, split behavior,
//! and fill-percent packing.

use burrowdb::Database;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

fn create_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db")).unwrap();
    (dir, db)
}

#[test]
fn cursor_yields_ten_thousand_keys_in_order() {
    let (_dir, db) = create_test_db();

    let mut keys: Vec<u32> = (0..10_000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    keys.shuffle(&mut rng);

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in &keys {
            b.put(
                format!("k{:04}", i).as_bytes(),
                format!("v{}", i).as_bytes(),
            )?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        let mut cursor = b.cursor();
        let mut count = 0u32;
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            assert_eq!(key, format!("k{:04}", count).into_bytes());
            assert_eq!(value, format!("v{}", count).into_bytes());
            count += 1;
            entry = cursor.next()?;
        }
        assert_eq!(count, 10_000);

        // exact seek
        let mut cursor = b.cursor();
        let (key, value) = cursor.seek(b"k5000")?.unwrap();
        assert_eq!(key, b"k5000");
        assert_eq!(value, b"v5000");

        // partial-match seek lands on the next key
        let (key, _) = cursor.seek(b"k4999z")?.unwrap();
        assert_eq!(key, b"k5000");
        Ok(())
    })
    .unwrap();
}

#[test]
fn prev_is_the_exact_inverse_of_next() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in 0..500 {
            b.put(format!("k{:03}", i).as_bytes(), b"v")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;

        let mut forward = Vec::new();
        let mut cursor = b.cursor();
        let mut entry = cursor.first()?;
        while let Some((key, _)) = entry {
            forward.push(key);
            entry = cursor.next()?;
        }

        let mut backward = Vec::new();
        let mut cursor = b.cursor();
        let mut entry = cursor.last()?;
        while let Some((key, _)) = entry {
            backward.push(key);
            entry = cursor.prev()?;
        }

        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 500);
        Ok(())
    })
    .unwrap();
}

#[test]
fn seek_before_first_and_past_last() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"m", b"1")?;
        b.put(b"t", b"2")?;

        let mut cursor = b.cursor();
        let (key, _) = cursor.seek(b"a")?.unwrap();
        assert_eq!(key, b"m");

        assert_eq!(cursor.seek(b"zzz")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_on_empty_bucket() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        let mut cursor = b.cursor();
        assert_eq!(cursor.first()?, None);
        assert_eq!(cursor.last()?, None);
        assert_eq!(cursor.next()?, None);
        assert_eq!(cursor.seek(b"x")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn value_cursor_skips_sub_buckets_and_vice_versa() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"a-key", b"1")?;
        b.create_bucket(b"m-bucket")?;
        b.put(b"z-key", b"2")?;
        b.create_bucket(b"b-bucket")?;

        let mut keys = Vec::new();
        let mut cursor = b.cursor();
        let mut entry = cursor.first()?;
        while let Some((key, _)) = entry {
            keys.push(key);
            entry = cursor.next()?;
        }
        assert_eq!(keys, vec![b"a-key".to_vec(), b"z-key".to_vec()]);

        let mut names = Vec::new();
        let mut cursor = b.buckets();
        let mut entry = cursor.first()?;
        while let Some(name) = entry {
            names.push(name);
            entry = cursor.next()?;
        }
        assert_eq!(names, vec![b"b-bucket".to_vec(), b"m-bucket".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn top_level_bucket_names_iterate_in_order() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        tx.create_bucket(b"zebra")?;
        tx.create_bucket(b"alpha")?;
        tx.create_bucket(b"mango")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut names = Vec::new();
        let mut cursor = tx.buckets();
        let mut entry = cursor.first()?;
        while let Some(name) = entry {
            names.push(name);
            entry = cursor.next()?;
        }
        assert_eq!(
            names,
            vec![b"alpha".to_vec(), b"mango".to_vec(), b"zebra".to_vec()]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn root_split_preserves_order_and_structure() {
    let (_dir, db) = create_test_db();
    let value = vec![0x42u8; 100];

    // enough in one commit to force the root leaf through several splits
    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in 0..2_000 {
            b.put(format!("key{:06}", i).as_bytes(), &value)?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        tx.check()?;
        let b = tx.bucket(b"b")?;
        for i in (0..2_000).step_by(97) {
            assert_eq!(b.get(format!("key{:06}", i).as_bytes())?, Some(value.clone()));
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn growing_across_many_commits_stays_consistent() {
    let (_dir, db) = create_test_db();

    for round in 0..20 {
        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists(b"b")?;
            for i in 0..100 {
                let key = format!("k{:02}-{:03}", round, i);
                b.put(key.as_bytes(), key.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
    }

    db.view(|tx| {
        tx.check()?;
        let b = tx.bucket(b"b")?;
        let mut count = 0;
        let mut cursor = b.cursor();
        let mut prev: Option<Vec<u8>> = None;
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            if let Some(p) = &prev {
                assert!(p < &key);
            }
            assert_eq!(key, value);
            prev = Some(key);
            count += 1;
            entry = cursor.next()?;
        }
        assert_eq!(count, 20 * 100);
        Ok(())
    })
    .unwrap();
}

#[test]
fn full_fill_percent_packs_into_fewer_pages() {
    let dir = tempfile::tempdir().unwrap();
    let value = vec![7u8; 64];

    let size_with = |fill: Option<f64>| -> u64 {
        let path = dir
            .path()
            .join(format!("fill-{}.db", fill.map(|f| f.to_string()).unwrap_or_default()));
        let db = Database::open(&path).unwrap();
        db.update(|tx| {
            let b = tx.create_bucket(b"b")?;
            if let Some(f) = fill {
                b.set_fill_percent(f);
            }
            for i in 0..1_000 {
                b.put(format!("key{:06}", i).as_bytes(), &value)?;
            }
            Ok(())
        })
        .unwrap();
        db.view(|tx| Ok(tx.size())).unwrap()
    };

    let default_size = size_with(None);
    let packed_size = size_with(Some(1.0));

    assert!(packed_size <= default_size);
}

#[test]
fn cursor_delete_removes_current_pair() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")?;
        b.put(b"c", b"3")?;

        let mut cursor = b.cursor();
        cursor.seek(b"b")?;
        cursor.delete()?;

        assert_eq!(b.get(b"b")?, None);
        assert_eq!(b.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(b.get(b"c")?, Some(b"3".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_on_read_tx_fails() {
    let (_dir, db) = create_test_db();
    db.update(|tx| {
        tx.create_bucket(b"b")?.put(b"k", b"v")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        let mut cursor = b.cursor();
        cursor.first()?;
        let err = cursor.delete().unwrap_err();
        assert_eq!(
            err.downcast_ref::<burrowdb::Error>(),
            Some(&burrowdb::Error::TxReadOnly)
        );
        Ok(())
    })
    .unwrap();
}
