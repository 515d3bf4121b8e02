use indexserver_protocol::{Branch, RepoId};
use indexserver_queue::IndexingQueue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn concurrent_dequeues_never_return_the_same_repository() {
    let queue = Arc::new(IndexingQueue::new());
    for id in 0..2_000u32 {
        queue.enqueue(id, f64::from(id % 7), vec![Branch::new("main", format!("c{id}"))]);
    }

    let seen = Arc::new(Mutex::new(Vec::<RepoId>::new()));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                let mut local = Vec::new();
                while let Some(entry) = queue.dequeue() {
                    local.push(entry.repo_id);
                }
                seen.lock().expect("seen lock").extend(local);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }

    let seen = seen.lock().expect("seen lock");
    let unique: HashSet<RepoId> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 2_000);
    assert_eq!(unique.len(), 2_000);
    assert!(queue.is_empty());
}

#[test]
fn concurrent_upserts_and_dequeues_keep_one_entry_per_repository() {
    let queue = Arc::new(IndexingQueue::new());
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..4u64)
        .map(|seed| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut rng = Lcg(seed + 1);
                for _ in 0..5_000 {
                    let id = (rng.next() % 64) as RepoId;
                    let priority = (rng.next() % 5) as f64;
                    queue.enqueue(id, priority, Vec::new());
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut taken = 0usize;
            while !done.load(Ordering::Acquire) {
                if queue.dequeue().is_some() {
                    taken += 1;
                }
                let listed = queue.list();
                let ids: HashSet<RepoId> = listed.iter().map(|p| p.entry.repo_id).collect();
                assert_eq!(ids.len(), listed.len(), "duplicate entry in snapshot");
            }
            taken
        })
    };

    for producer in producers {
        producer.join().expect("producer thread");
    }
    done.store(true, Ordering::Release);
    consumer.join().expect("consumer thread");

    assert!(queue.len() <= 64);
}

#[test]
fn random_enqueue_sequences_reflect_the_latest_call_per_repository() {
    let queue = IndexingQueue::new();
    let mut rng = Lcg(42);
    let mut latest: HashMap<RepoId, (f64, String)> = HashMap::new();

    for step in 0..3_000 {
        let id = (rng.next() % 50) as RepoId;
        let priority = (rng.next() % 10) as f64;
        let commit = format!("c{step}");
        queue.enqueue(id, priority, vec![Branch::new("main", commit.clone())]);
        latest.insert(id, (priority, commit));
    }

    let listed = queue.list();
    assert_eq!(listed.len(), latest.len());
    for position in &listed {
        let (priority, commit) = &latest[&position.entry.repo_id];
        assert_eq!(position.entry.priority, *priority);
        assert_eq!(position.entry.desired_branches[0].version, *commit);
    }

    let mut previous: Option<(f64, std::time::Instant)> = None;
    for position in &listed {
        if let Some((prio, at)) = previous {
            assert!(prio >= position.entry.priority);
            if prio == position.entry.priority {
                assert!(at <= position.entry.enqueued_at);
            }
        }
        previous = Some((position.entry.priority, position.entry.enqueued_at));
    }
}
