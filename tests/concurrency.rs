//! Concurrent insertion and marking: many threads racing on the same
//! payloads must agree on one index per payload, with exactly one
//! winner per creation.

use std::{
    collections::HashMap,
    sync::Barrier,
    thread,
};

use unitable::UniqueTable;

const THREADS: usize = 8;

#[test]
fn same_payload_race_has_one_winner() {
    let table = UniqueTable::with_capacity(512, 512).unwrap();
    let barrier = Barrier::new(THREADS);

    let results: Vec<(u64, bool)> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    table.lookup(42, 99).expect("table is nearly empty")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let index = results[0].0;
    assert!(index >= 2);
    assert!(results.iter().all(|&(i, _)| i == index));
    assert_eq!(
        results.iter().filter(|&&(_, created)| created).count(),
        1,
        "exactly one thread must create the entry"
    );

    // Losing reservations were released: the payload occupies exactly
    // one slot beyond the two reserved ones.
    let occupied = (0..512).filter(|&i| table.is_occupied(i)).count();
    assert_eq!(occupied, 3);
}

#[test]
fn hammering_the_same_payload_set_stays_unique() {
    const PAYLOADS: u64 = 2000;

    let table = UniqueTable::with_capacity(16384, 16384).unwrap();
    let barrier = Barrier::new(THREADS);

    let per_thread: Vec<Vec<(u64, u64, bool)>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    (0..PAYLOADS)
                        .map(|k| {
                            let (index, created) =
                                table.lookup(k, k.rotate_left(17)).expect("plenty of room");
                            (k, index, created)
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut index_of = HashMap::new();
    let mut creators = HashMap::new();
    for results in &per_thread {
        for &(k, index, created) in results {
            assert!(index >= 2);
            let known = index_of.entry(k).or_insert(index);
            assert_eq!(*known, index, "threads disagree on payload {k}");
            if created {
                *creators.entry(k).or_insert(0u32) += 1;
            }
        }
    }
    assert_eq!(index_of.len() as u64, PAYLOADS);
    assert!(creators.values().all(|&n| n == 1));

    // Distinct payloads landed on distinct indices.
    let mut indices: Vec<u64> = index_of.values().copied().collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len() as u64, PAYLOADS);

    // A quiet second pass still finds everything.
    for (&k, &index) in &index_of {
        assert_eq!(table.lookup(k, k.rotate_left(17)), Some((index, false)));
    }
}

#[test]
fn concurrent_marks_have_one_first_setter() {
    let table = UniqueTable::with_capacity(512, 512).unwrap();
    let (index, _) = table.lookup(5, 6).unwrap();
    let barrier = Barrier::new(THREADS);

    let firsts: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    table.mark(index)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&first| first)
            .count()
    });

    assert_eq!(firsts, 1);
    assert!(table.is_marked(index));
    assert_eq!(table.count_marked(), 1);
}

#[test]
fn gc_cycle_after_concurrent_inserts_preserves_marked_indices() {
    const PAYLOADS: u64 = 1000;

    let table = UniqueTable::with_capacity(8192, 8192).unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                for k in 0..PAYLOADS {
                    table.lookup(k, k + 1).expect("plenty of room");
                }
            });
        }
    });

    let mut live = Vec::new();
    for k in 0..PAYLOADS {
        let (index, created) = table.lookup(k, k + 1).unwrap();
        assert!(!created);
        if k % 2 == 0 {
            table.mark(index);
            live.push((k, index));
        }
    }

    table.clear();
    table.rehash().unwrap();

    for &(k, index) in &live {
        assert_eq!(table.lookup(k, k + 1), Some((index, false)));
    }
}
