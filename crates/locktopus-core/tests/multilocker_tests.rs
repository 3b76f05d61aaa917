// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Behavioral suite for the multilocker engine: FIFO fairness, reader
//! concurrency, hierarchy conflicts, statistics draining and close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use locktopus_core::{Lock, LockMode, MultiLocker, MultiLockerStats, ResourceLock, Unlocker};

fn read(path: &[&str]) -> ResourceLock {
    ResourceLock::new(LockMode::Read, path.iter().copied())
}

fn write(path: &[&str]) -> ResourceLock {
    ResourceLock::new(LockMode::Write, path.iter().copied())
}

fn assert_waiting(lock: &Lock) {
    assert!(!lock.is_ready(), "lock {} should still wait", lock.id());
}

fn assert_wont_wait(lock: &Lock) {
    assert!(
        lock.is_ready(),
        "lock {} should not wait for acquiring",
        lock.id()
    );
}

/// Polls `condition` until it holds or a generous deadline passes; the
/// garbage collector runs in the background, so surface-related counters
/// drain asynchronously.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn unlocker_passed_in_is_returned_from_acquire() {
    let m = MultiLocker::new();

    let unlocker = Unlocker::new();
    let received = m
        .lock(vec![read(&["a", "b", "c"])], Some(unlocker.clone()))
        .acquire()
        .await;

    assert!(received == unlocker);
}

#[tokio::test]
async fn single_group_locks_immediately() {
    let m = MultiLocker::new();

    let lock = m.lock(vec![read(&["a", "b", "c"])], None);
    assert_wont_wait(&lock);
}

#[tokio::test]
async fn premature_unlock_is_tolerated() {
    let m = MultiLocker::new();

    let unlocker = Unlocker::new();
    let early = unlocker.clone();
    let released = tokio::spawn(async move { early.unlock().await });
    tokio::task::yield_now().await;

    let lock = m.lock(vec![read(&["1"])], Some(unlocker));
    lock.acquire().await;

    released.await.unwrap();
}

#[tokio::test]
async fn duplicate_pairs_do_not_deadlock() {
    let m = MultiLocker::new();

    let lock = m.lock(
        vec![write(&["a", "b", "c"]), write(&["a", "b", "c"])],
        None,
    );
    lock.acquire().await;

    // The duplicate collapses to one effective slot.
    assert_eq!(m.statistics().locks_acquired, 1);
}

#[tokio::test]
async fn root_lock_blocks_root_lock() {
    let m = MultiLocker::new();

    m.lock(vec![write(&[])], None);
    let w = m.lock(vec![write(&[])], None);

    assert_waiting(&w);
}

#[tokio::test]
async fn concurrent_group_blocks() {
    let m = MultiLocker::new();

    m.lock(vec![write(&["a", "b", "c"])], None);
    let w = m.lock(vec![write(&["a", "b", "c"])], None);

    assert_waiting(&w);
}

#[tokio::test]
async fn root_lock_blocks_deeper_paths() {
    let m = MultiLocker::new();

    m.lock(vec![write(&[])], None);
    let w = m.lock(vec![write(&["a", "b", "c"])], None);

    assert_waiting(&w);
}

#[tokio::test]
async fn release_wakes_next_writer() {
    let m = MultiLocker::new();

    let w1 = m.lock(vec![write(&["a", "b", "c"])], None);
    let w2 = m.lock(vec![write(&["a", "b", "c"])], None);

    assert_wont_wait(&w1);
    assert_waiting(&w2);

    let unlocker = w1.acquire().await;
    assert_waiting(&w2);

    unlocker.unlock().await;
    w2.acquire().await;
}

#[tokio::test]
async fn parallel_writes_on_disjoint_paths() {
    let m = MultiLocker::new();

    let w1 = m.lock(vec![write(&["a", "b", "1"])], None);
    assert_wont_wait(&w1);

    let w2 = m.lock(vec![write(&["a", "b", "2"])], None);
    assert_wont_wait(&w2);
}

#[tokio::test]
async fn parallel_reads_at_same_path() {
    let m = MultiLocker::new();

    let r1 = m.lock(vec![read(&["a", "b"])], None);
    assert_wont_wait(&r1);

    let r2 = m.lock(vec![read(&["a", "b"])], None);
    assert_wont_wait(&r2);
}

#[tokio::test]
async fn write_ancestor_blocks_descendant() {
    let m = MultiLocker::new();

    let a = m.lock(vec![write(&["a", "b"])], None);
    let b = m.lock(vec![write(&["a", "b", "c"])], None);

    assert_wont_wait(&a);
    assert_waiting(&b);

    a.acquire().await.unlock().await;
    b.acquire().await;
}

#[tokio::test]
async fn write_descendant_blocks_ancestor() {
    let m = MultiLocker::new();

    let a = m.lock(vec![write(&["a", "b", "c"])], None);
    let b = m.lock(vec![write(&["a", "b"])], None);

    assert_wont_wait(&a);
    assert_waiting(&b);

    a.acquire().await.unlock().await;
    b.acquire().await;
}

#[tokio::test]
async fn adjacent_reads_do_not_block_each_other() {
    let m = MultiLocker::new();

    let w1 = m.lock(vec![write(&["a"])], None);
    let w2 = m.lock(vec![read(&["a", "b"])], None);
    let w3 = m.lock(vec![read(&["a", "b", "1"])], None);
    let w4 = m.lock(vec![read(&["a", "b", "2"])], None);
    let w5 = m.lock(vec![read(&["a", "b", "1", "a"])], None);
    let w6 = m.lock(vec![read(&["a", "b", "1", "b"])], None);
    let w7 = m.lock(vec![read(&["a", "b", "2", "a"])], None);
    let w8 = m.lock(vec![read(&["a", "b", "2", "b"])], None);
    let w9 = m.lock(vec![read(&[])], None);
    let w10 = m.lock(vec![write(&["a", "b", "2", "b", "c"])], None);

    assert_wont_wait(&w1);
    for w in [&w2, &w3, &w4, &w5, &w6, &w7, &w8, &w9, &w10] {
        assert_waiting(w);
    }

    let u = w1.acquire().await;

    for w in [&w2, &w3, &w4, &w5, &w6, &w7, &w8, &w9, &w10] {
        assert_waiting(w);
    }

    u.unlock().await;

    let mut unlockers = Vec::new();
    for w in [&w9, &w8, &w7, &w6, &w5, &w4, &w3, &w2] {
        unlockers.push(w.acquire().await);
    }

    assert_waiting(&w10);

    for u in unlockers {
        u.unlock().await;
    }

    w10.acquire().await;
}

#[tokio::test]
async fn partial_write_overlap_is_strictly_fifo() {
    let m = MultiLocker::new();

    let w1 = m.lock(
        vec![write(&["a", "1"]), write(&["a", "2"]), write(&["a", "3"])],
        None,
    );
    let w2 = m.lock(
        vec![read(&["a", "3"]), read(&["a", "4"]), read(&["a", "5"])],
        None,
    );
    let w3 = m.lock(
        vec![write(&["a", "5"]), write(&["a", "6"]), write(&["a", "7"])],
        None,
    );

    assert_waiting(&w2);
    assert_waiting(&w3);

    w1.acquire().await.unlock().await;
    assert_waiting(&w3);

    w2.acquire().await.unlock().await;
    w3.acquire().await.unlock().await;
}

#[tokio::test]
async fn partial_read_overlap_acquires_concurrently() {
    let m = MultiLocker::new();

    let w1 = m.lock(
        vec![write(&["a", "1"]), write(&["a", "2"]), read(&["a", "3"])],
        None,
    );
    let w2 = m.lock(
        vec![read(&["a", "3"]), write(&["a", "4"]), read(&["a", "5"])],
        None,
    );
    let w3 = m.lock(
        vec![read(&["a", "5"]), write(&["a", "6"]), write(&["a", "7"])],
        None,
    );

    w3.acquire().await;
    w2.acquire().await;
    w1.acquire().await;
}

#[tokio::test]
async fn head_after_tail_keeps_serialization() {
    let m = MultiLocker::new();

    let w1 = m.lock(vec![write(&["a", "1"])], None);

    m.lock(vec![read(&["a", "1", "2"]), write(&["a", "1"])], None);

    let w3 = m.lock(vec![read(&["a", "1"])], None);

    w1.acquire().await.unlock().await;

    assert_waiting(&w3);
}

#[tokio::test]
async fn tail_after_head_keeps_serialization() {
    let m = MultiLocker::new();

    m.lock(vec![read(&["a"]), write(&["a", "b"])], None);

    let w1 = m.lock(vec![read(&["a", "c"])], None);
    assert_wont_wait(&w1);

    let w2 = m.lock(vec![read(&["a"])], None);
    assert_waiting(&w2);

    let w3 = m.lock(vec![read(&["a", "b"])], None);
    assert_waiting(&w3);
}

#[tokio::test]
#[should_panic(expected = "already closed")]
async fn double_close_panics() {
    let m = MultiLocker::new();
    m.close().await;
    m.close().await;
}

#[tokio::test]
#[should_panic(expected = "multilocker is closed")]
async fn lock_after_close_panics() {
    let m = MultiLocker::new();
    m.close().await;
    m.lock(vec![read(&["a"])], None);
}

#[tokio::test]
#[should_panic(expected = "unlock called twice")]
async fn double_unlock_panics() {
    let m = MultiLocker::new();

    let u = m.lock(vec![write(&["a"])], None).acquire().await;
    u.unlock().await;
    u.unlock().await;
}

#[tokio::test]
async fn group_ids_are_monotonic() {
    let m = MultiLocker::new();

    let w1 = m.lock(vec![read(&["a"])], None);
    let w2 = m.lock(vec![read(&["a"])], None);

    assert_eq!(w1.id(), 1);
    assert_eq!(w2.id(), 2);
    assert_eq!(m.statistics().last_group_id, 2);
}

#[tokio::test]
async fn token_counts_follow_group_lifecycle() {
    let m = MultiLocker::new();

    let s0 = m.statistics();

    let lock = m.lock(
        vec![write(&["a", "b", "a"]), write(&["a", "b", "c"])],
        None,
    );
    let u = lock.acquire().await;

    let s1 = m.statistics();
    assert_eq!(s1.tokens_total, s0.tokens_total + 6);
    assert_eq!(s1.tokens_unique, s0.tokens_unique + 3);

    u.unlock().await;

    let s2 = m.statistics();
    assert_eq!(s2.tokens_total, s0.tokens_total);
    assert_eq!(s2.tokens_unique, s0.tokens_unique);
}

#[tokio::test]
async fn group_counters_follow_acquisition() {
    let m = MultiLocker::new();

    let s0 = m.statistics();
    assert_eq!(s0.groups_pending, 0);
    assert_eq!(s0.groups_acquired, 0);

    let locker0 = m.lock(vec![write(&["a"])], None);

    let s1 = m.statistics();
    assert_eq!(s1.groups_pending, 0);
    assert_eq!(s1.groups_acquired, 1);

    let locker1 = m.lock(vec![read(&["a"])], None);

    let s2 = m.statistics();
    assert_eq!(s2.groups_pending, 1);
    assert_eq!(s2.groups_acquired, 1);

    locker0.acquire().await.unlock().await;
    locker1.acquire().await;

    let s3 = m.statistics();
    assert_eq!(s3.groups_pending, 0);
    assert_eq!(s3.groups_acquired, 1);

    let locker2 = m.lock(vec![read(&["a"])], None);
    locker2.acquire().await;

    let s4 = m.statistics();
    assert_eq!(s4.groups_pending, 0);
    assert_eq!(s4.groups_acquired, 2);
}

#[tokio::test]
async fn lock_counters_follow_acquisition() {
    let m = MultiLocker::new();

    let locker0 = m.lock(vec![write(&["a", "b"])], None);

    let s1 = m.statistics();
    assert_eq!(s1.locks_acquired, 1);
    assert_eq!(s1.locks_pending, 0);

    let locker1 = m.lock(vec![read(&["a", "b"])], None);

    let s2 = m.statistics();
    assert_eq!(s2.locks_acquired, 1);
    assert_eq!(s2.locks_pending, 1);

    locker0.acquire().await.unlock().await;
    locker1.acquire().await;

    let s3 = m.statistics();
    assert_eq!(s3.locks_acquired, 1);
    assert_eq!(s3.locks_pending, 0);

    locker1.acquire().await.unlock().await;

    let s4 = m.statistics();
    assert_eq!(s4.locks_acquired, 0);
    assert_eq!(s4.locks_pending, 0);
}

#[tokio::test]
async fn write_head_shadows_deeper_writes_of_same_group() {
    let m = MultiLocker::new();

    m.lock(
        vec![write(&["a"]), write(&["a", "b"]), write(&["a", "b", "c"])],
        None,
    );

    assert_eq!(m.statistics().locks_acquired, 1);
}

#[tokio::test]
async fn read_head_does_not_shadow_deeper_write() {
    let m = MultiLocker::new();

    m.lock(vec![read(&["a"]), write(&["a", "b"])], None);

    assert_eq!(m.statistics().locks_acquired, 2);
}

#[tokio::test]
async fn stronger_mode_wins_within_one_group() {
    let m = MultiLocker::new();

    // The read at the same prefix collapses into the earlier write.
    let lock = m.lock(vec![write(&["a"]), read(&["a"])], None);
    lock.acquire().await;
    assert_eq!(m.statistics().locks_acquired, 1);

    // A later writer still serializes behind the whole group.
    let w = m.lock(vec![write(&["a"])], None);
    assert_waiting(&w);
}

#[tokio::test]
async fn lockrefs_are_collected_after_unlock() {
    let m = MultiLocker::new();

    let s0 = m.statistics();
    assert_eq!(s0.lockref_count, 0);

    let lock = m.lock(vec![read(&["a"]), write(&["a", "b"])], None);

    assert!(m.statistics().lockref_count > 0);

    lock.acquire().await.unlock().await;

    m.close().await;

    let s2 = m.statistics();
    assert_eq!(s2.lockref_count, 0);
}

#[tokio::test]
async fn counters_drain_after_unlock_without_close() {
    let m = MultiLocker::new();

    let lock = m.lock(vec![write(&["a", "b"]), read(&["a", "c"])], None);
    lock.acquire().await.unlock().await;

    wait_until(|| {
        let s = m.statistics();
        s == MultiLockerStats {
            last_group_id: 1,
            tokens_total: 1,
            tokens_unique: 1,
            ..MultiLockerStats::default()
        }
    })
    .await;
}

#[tokio::test]
async fn closed_engine_reports_empty_surface() {
    let m = MultiLocker::new();

    for _ in 0..3 {
        let l = m.lock(vec![read(&["0"])], None);
        let l1 = m.lock(vec![read(&[])], None);

        l.acquire().await.unlock().await;
        l1.acquire().await.unlock().await;
    }

    m.close().await;

    let s = m.statistics();
    assert_eq!(s.path_count, 0);
    assert_eq!(s.tokens_unique, 0);
    assert_eq!(s.tokens_total, 0);
    assert_eq!(s.lockref_count, 0);
}

#[tokio::test]
async fn closing_an_idle_engine_is_a_noop() {
    let m = MultiLocker::new();

    m.close().await;

    let s = m.statistics();
    assert_eq!(s.last_group_id, 0);
    assert_eq!(s.path_count, 0);
    assert_eq!(s.tokens_unique, 0);
}

#[tokio::test]
async fn acquire_is_idempotent() {
    let m = MultiLocker::new();

    let l = m.lock(vec![write(&["a"])], None);
    let l1 = m.lock(vec![write(&["a"])], None);

    assert_waiting(&l1);

    l.acquire().await;
    l.acquire().await;
    let u = l.acquire().await;

    u.unlock().await;

    l1.acquire().await;
}

#[tokio::test]
async fn ready_fires_without_contention() {
    let m = MultiLocker::new();

    let l = m.lock(vec![write(&["a"])], None);
    l.ready().await;
}

#[tokio::test]
async fn ready_fires_after_predecessor_unlocks() {
    let m = MultiLocker::new();

    let l = m.lock(vec![write(&["a"])], None);
    let l1 = m.lock(vec![write(&["a"])], None);

    assert_waiting(&l1);

    l.acquire().await.unlock().await;

    l1.ready().await;
}

#[tokio::test]
async fn root_read_after_group_with_leading_root_read() {
    let m = MultiLocker::new();

    let l = m.lock(vec![read(&[]), write(&["c"])], None);
    let l1 = m.lock(vec![read(&[])], None);

    l.acquire().await;

    assert_waiting(&l1);
}

#[tokio::test]
async fn group_upgrading_its_own_read_waits_for_earlier_reader() {
    let m = MultiLocker::new();

    let l = m.lock(vec![read(&["a"])], None);
    l.acquire().await;

    let l1 = m.lock(vec![read(&["a"]), write(&["a"])], None);

    assert_waiting(&l1);
}

#[tokio::test]
async fn deep_write_under_held_read_prefix_waits() {
    let m = MultiLocker::new();

    let l = m.lock(vec![read(&["1"])], None);
    l.acquire().await;

    let l1 = m.lock(
        vec![read(&["1", "5"]), write(&["1", "2", "4", "1"])],
        None,
    );

    assert_waiting(&l1);
}

#[tokio::test]
async fn root_write_in_group_waits_for_unrelated_writer() {
    let m = MultiLocker::new();

    let l = m.lock(vec![write(&["2"])], None);
    l.acquire().await;

    let l1 = m.lock(vec![read(&["1"]), write(&["3"]), write(&[])], None);

    assert_waiting(&l1);
}

#[tokio::test]
async fn read_under_own_write_head_of_earlier_group_waits() {
    let m = MultiLocker::new();

    let l = m.lock(vec![write(&["2", "1"]), read(&["2"])], None);
    l.acquire().await;

    let l1 = m.lock(vec![read(&["2"]), read(&["2", "1", "1"])], None);

    assert_waiting(&l1);
}

#[tokio::test]
async fn grouped_fairness_is_fifo() {
    let m = MultiLocker::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let w1 = m.lock(vec![read(&["a"])], None);
    let w2 = m.lock(vec![write(&["a", "1"]), write(&["a", "2"])], None);
    let w3a = m.lock(vec![read(&[])], None);
    let w3b = m.lock(vec![read(&["a", "3"])], None);

    let mut tasks = Vec::new();
    for (lock, rank) in [(w3b, 3), (w3a, 3), (w2, 2), (w1, 1)] {
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let u = lock.acquire().await;
            order.lock().unwrap().push(rank);
            u.unlock().await;
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 3]);
}

#[tokio::test]
async fn interleaved_waves_acquire_in_submission_order() {
    let m = MultiLocker::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let w1 = m.lock(vec![read(&["a", "b", "c", "d"])], None);
    let w2 = m.lock(vec![write(&["a", "b"])], None);
    let w3a = m.lock(vec![write(&["a", "b", "1", "a"])], None);
    let w3b = m.lock(vec![write(&["a", "b", "1", "b"])], None);
    let w3c = m.lock(vec![write(&["a", "b", "2", "a"])], None);
    let w3d = m.lock(vec![write(&["a", "b", "2", "b"])], None);
    let w4a = m.lock(vec![read(&[])], None);
    let w4b = m.lock(vec![read(&["a", "b", "3"])], None);
    let w4c = m.lock(vec![read(&["a", "b", "3", "a"])], None);
    let w4d = m.lock(vec![read(&["a", "b", "3", "a", "b"])], None);

    let mut tasks = Vec::new();
    for (lock, rank) in [
        (w4d, 4),
        (w4c, 4),
        (w4b, 4),
        (w4a, 4),
        (w3d, 3),
        (w3c, 3),
        (w3b, 3),
        (w3a, 3),
        (w2, 2),
        (w1, 1),
    ] {
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let u = lock.acquire().await;
            order.lock().unwrap().push(rank);
            u.unlock().await;
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec![1, 2, 3, 3, 3, 3, 4, 4, 4, 4]
    );
}

#[tokio::test]
async fn empty_group_is_trivially_ready() {
    let m = MultiLocker::new();

    let lock = m.lock(Vec::new(), None);
    assert_wont_wait(&lock);
    lock.acquire().await.unlock().await;
}

#[tokio::test]
async fn stats_snapshot_serializes_with_original_field_names() {
    let m = MultiLocker::new();
    m.lock(vec![write(&["a"])], None).acquire().await;

    let json = serde_json::to_value(m.statistics()).unwrap();

    assert_eq!(json["LastGroupID"], 1);
    assert_eq!(json["GroupsAcquired"], 1);
    assert_eq!(json["LocksAcquired"], 1);
    assert!(json["LockrefCount"].as_i64().unwrap() > 0);
    assert_eq!(json["TokensUnique"], 2);
    assert_eq!(json["TokensTotal"], 2);
    assert!(json["PathCount"].as_i64().unwrap() > 0);
    assert_eq!(json["GroupsPending"], 0);
    assert_eq!(json["LocksPending"], 0);
}
