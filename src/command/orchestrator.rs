//! Fan-out of one call into per-node sub-commands
//!
//! Jobs are pulled off a shared queue by a fixed set of scoped worker
//! threads, so at most `limit` sub-commands are in flight at once.

use std::thread;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::warn;

/// Run `task` over every job with at most `limit` running concurrently.
///
/// A `limit` of zero runs every job on its own thread. Results are returned
/// in job order.
pub(crate) fn run_bounded<J, R, F>(name: &str, jobs: Vec<J>, limit: usize, task: F) -> Vec<R>
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    let count = jobs.len();
    if count <= 1 {
        return jobs.into_iter().map(task).collect();
    }
    let workers = if limit == 0 { count } else { limit.min(count) };

    let (tx, rx) = unbounded();
    for job in jobs.into_iter().enumerate() {
        // receiver is alive for the duration of this function
        let _ = tx.send(job);
    }
    drop(tx);

    let results: Mutex<Vec<Option<R>>> = Mutex::new((0..count).map(|_| None).collect());
    let work = || {
        while let Ok((index, job)) = rx.recv() {
            let result = task(job);
            results.lock()[index] = Some(result);
        }
    };

    thread::scope(|scope| {
        for worker_id in 1..workers {
            let spawned = thread::Builder::new()
                .name(format!("shardline-{}-{}", name, worker_id))
                .spawn_scoped(scope, work);
            if let Err(e) = spawned {
                warn!("Failed to spawn {} worker {}: {}", name, worker_id, e);
                break;
            }
        }
        // the calling thread is worker zero
        work();
    });

    results.into_inner().into_iter().flatten().collect()
}
