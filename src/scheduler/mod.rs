//! Probe scheduler: one recurring timer per schedulable node.

pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::db::{DbError, Node, NodeStatus, Sample, Store};
use crate::probe::{self, ProbeTarget};

/// Owns the timer registry and drives the probe/persist/transition cycle.
///
/// Registry mutations are serialized through the write lock; probes run in
/// spawned tasks outside it, with a per-node single-permit gate so at most
/// one probe is ever in flight per node.
pub struct Scheduler {
    store: Arc<Store>,
    timers: Arc<RwLock<HashMap<String, TimerHandle>>>,
    next_generation: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

struct TimerHandle {
    stop_tx: broadcast::Sender<()>,
    /// Distinguishes a loop's own registry entry from a successor installed
    /// by a later `start_node`, so self-cleanup never removes the successor.
    generation: u64,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            timers: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Read every schedulable node from the store and install its timer.
    /// Executed once at process start.
    pub async fn boot(&self) -> Result<(), DbError> {
        let nodes = self.store.list_active()?;
        tracing::info!("scheduler: booting with {} nodes", nodes.len());
        for node in nodes {
            self.start_node(&node).await;
        }
        Ok(())
    }

    /// Install a repeating timer for the node at its configured cadence,
    /// cancelling any existing timer first. The first tick fires one full
    /// period after installation.
    pub async fn start_node(&self, node: &Node) {
        let period = Duration::from_millis(node.check_interval_ms.max(1) as u64);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = broadcast::channel(1);

        {
            let mut timers = self.timers.write().await;
            if let Some(prev) = timers.insert(
                node.id.clone(),
                TimerHandle {
                    stop_tx,
                    generation,
                },
            ) {
                let _ = prev.stop_tx.send(());
                tracing::info!("scheduler: reinstalling timer for {}", node.name);
            } else {
                tracing::info!(
                    "scheduler: starting {} every {}ms",
                    node.name,
                    node.check_interval_ms
                );
            }
        }

        let store = self.store.clone();
        let timers = self.timers.clone();
        let in_flight = self.in_flight.clone();
        let node_id = node.id.clone();

        tokio::spawn(async move {
            run_probe_loop(store, node_id.clone(), period, stop_rx, in_flight).await;

            // The loop exited on its own (node deleted or paused): drop our
            // registry entry unless a newer timer already took the slot.
            let mut timers = timers.write().await;
            if timers.get(&node_id).map(|h| h.generation) == Some(generation) {
                timers.remove(&node_id);
            }
        });
    }

    /// Cancel the timer for `node_id` if present. Safe to call from a tick.
    /// After this returns, no further tick will probe that node.
    pub async fn stop_node(&self, node_id: &str) {
        let handle = self.timers.write().await.remove(node_id);
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(());
            tracing::info!("scheduler: stopped {}", node_id);
        }
    }

    pub async fn is_scheduled(&self, node_id: &str) -> bool {
        self.timers.read().await.contains_key(node_id)
    }

    pub async fn active_count(&self) -> usize {
        self.timers.read().await.len()
    }

    /// Cancel every timer and clear the registry. In-flight probes are not
    /// aborted; see [`Scheduler::shutdown`] for a bounded drain.
    pub async fn stop_all(&self) {
        let mut timers = self.timers.write().await;
        let count = timers.len();
        for (_, handle) in timers.drain() {
            let _ = handle.stop_tx.send(());
        }
        if count > 0 {
            tracing::info!("scheduler: stopped all {} timers", count);
        }
    }

    /// Stop all timers, then wait up to `grace` for in-flight probes.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop_all().await;
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "scheduler: {} probes still in flight at shutdown deadline",
                    self.in_flight.load(Ordering::SeqCst)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Timer loop for a single node. Exits on a stop signal, or on its own when
/// a tick finds the node deleted or paused.
async fn run_probe_loop(
    store: Arc<Store>,
    node_id: String,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
    in_flight: Arc<AtomicUsize>,
) {
    // One permit: a tick that fires while the previous probe is still
    // running is dropped, never queued.
    let probe_gate = Arc::new(Semaphore::new(1));

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                // Fresh read so config edits apply on the next tick and
                // delete/pause races resolve here instead of probing.
                let node = match store.get_node(&node_id) {
                    Ok(node) => node,
                    Err(DbError::NotFound) => {
                        tracing::info!("scheduler: {} no longer exists, cancelling timer", node_id);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("scheduler: failed to read {}: {}", node_id, e);
                        continue;
                    }
                };
                if node.status == NodeStatus::Paused {
                    tracing::info!("scheduler: {} is paused, cancelling timer", node_id);
                    break;
                }

                let permit = match probe_gate.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(
                            "scheduler: skipping tick for {}, previous probe still in flight",
                            node.name
                        );
                        continue;
                    }
                };

                let store = store.clone();
                let in_flight = in_flight.clone();
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _permit = permit;
                    run_tick(&store, &node).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }
}

/// One probe cycle: execute, persist the sample, apply the state machine.
/// Every failure on this path is logged and swallowed so the timer keeps
/// firing.
pub(crate) async fn run_tick(store: &Store, node: &Node) {
    // Spread probes out so aligned intervals don't burst together.
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let outcome = probe::execute(&ProbeTarget::from_node(node)).await;

    let sample = Sample {
        id: Uuid::new_v4().to_string(),
        node_id: node.id.clone(),
        status_code: outcome.status_code,
        status_text: outcome.status_text.clone(),
        response_time_ms: outcome.response_time_ms,
        success: outcome.success,
        error_message: outcome.error_message.clone(),
        created_at: outcome.checked_at,
    };
    if let Err(e) = store.append_sample(&sample) {
        tracing::error!("scheduler: failed to persist sample for {}: {}", node.name, e);
        return;
    }

    let update = state::apply(
        node.status,
        node.consecutive_failures,
        node.failure_threshold,
        outcome.success,
    );

    let persisted = if outcome.success {
        store.reset_failures(&node.id, Some(outcome.checked_at))
    } else {
        store.increment_failures(&node.id, outcome.checked_at)
    };
    match persisted {
        Ok(()) => {}
        // Deleted while the probe was in flight; the sample stays, the
        // node mutations are moot.
        Err(DbError::NotFound) => return,
        Err(e) => {
            tracing::error!("scheduler: failed to update counters for {}: {}", node.name, e);
            return;
        }
    }

    if let Some(status) = update.status {
        match store.update_status(&node.id, status) {
            Ok(()) => match status {
                NodeStatus::Active => {
                    tracing::info!("{} recovered after {} failures", node.name, node.consecutive_failures);
                }
                NodeStatus::Warning => {
                    tracing::warn!("{} entered warning ({} consecutive failures)", node.name, update.consecutive_failures);
                }
                NodeStatus::Down => {
                    tracing::warn!("{} is down ({} consecutive failures)", node.name, update.consecutive_failures);
                }
                NodeStatus::Paused => {}
            },
            Err(DbError::NotFound) => {}
            Err(e) => {
                tracing::error!("scheduler: failed to update status for {}: {}", node.name, e);
            }
        }
    } else if update.recovered {
        tracing::info!("{} recovered after {} failures", node.name, node.consecutive_failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_stub_server, test_node};

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn registry_tracks_start_and_stop() {
        let store = store();
        let scheduler = Scheduler::new(store.clone());
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        assert!(!scheduler.is_scheduled(&node.id).await);
        scheduler.start_node(&node).await;
        assert!(scheduler.is_scheduled(&node.id).await);
        assert_eq!(scheduler.active_count().await, 1);

        scheduler.stop_node(&node.id).await;
        assert!(!scheduler.is_scheduled(&node.id).await);
        assert_eq!(scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn double_start_keeps_exactly_one_timer() {
        let store = store();
        let scheduler = Scheduler::new(store.clone());
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        scheduler.start_node(&node).await;
        scheduler.start_node(&node).await;
        assert_eq!(scheduler.active_count().await, 1);

        scheduler.stop_node(&node.id).await;
        assert_eq!(scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn stop_is_a_noop_for_unknown_nodes() {
        let scheduler = Scheduler::new(store());
        scheduler.stop_node("missing").await;
        assert_eq!(scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn stop_all_clears_the_registry() {
        let store = store();
        let scheduler = Scheduler::new(store.clone());
        for name in ["a", "b", "c"] {
            let node = test_node("u1", name);
            store.create_node(&node).unwrap();
            scheduler.start_node(&node).await;
        }
        assert_eq!(scheduler.active_count().await, 3);

        scheduler.stop_all().await;
        assert_eq!(scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn boot_schedules_all_but_paused() {
        let store = store();
        let active = test_node("u1", "a");
        let paused = test_node("u1", "b");
        let down = test_node("u2", "c");
        for n in [&active, &paused, &down] {
            store.create_node(n).unwrap();
        }
        store.update_status(&paused.id, NodeStatus::Paused).unwrap();
        store.update_status(&down.id, NodeStatus::Down).unwrap();

        let scheduler = Scheduler::new(store.clone());
        scheduler.boot().await.unwrap();

        assert_eq!(scheduler.active_count().await, 2);
        assert!(scheduler.is_scheduled(&active.id).await);
        assert!(scheduler.is_scheduled(&down.id).await);
        assert!(!scheduler.is_scheduled(&paused.id).await);
    }

    #[tokio::test]
    async fn tick_records_sample_and_keeps_node_active() {
        let store = store();
        let url = spawn_stub_server(vec![200]).await;
        let mut node = test_node("u1", "API");
        node.endpoint_url = url;
        node.expected_status_codes = vec![200];
        store.create_node(&node).unwrap();

        run_tick(&store, &node).await;

        let samples = store.list_by_node(&node.id, 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].success);
        assert_eq!(samples[0].status_code, 200);

        let node = store.get_node(&node.id).unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.consecutive_failures, 0);
        assert!(node.last_check_at.is_some());
    }

    #[tokio::test]
    async fn three_failures_walk_through_warning_to_down() {
        let store = store();
        let url = spawn_stub_server(vec![503]).await;
        let mut node = test_node("u1", "API");
        node.endpoint_url = url;
        node.expected_status_codes = vec![200];
        node.failure_threshold = 3;
        store.create_node(&node).unwrap();

        let expectations = [
            (1, NodeStatus::Active),
            (2, NodeStatus::Warning),
            (3, NodeStatus::Down),
        ];
        for (failures, status) in expectations {
            let fresh = store.get_node(&node.id).unwrap();
            run_tick(&store, &fresh).await;
            let fresh = store.get_node(&node.id).unwrap();
            assert_eq!(fresh.consecutive_failures, failures);
            assert_eq!(fresh.status, status);
        }
        assert_eq!(store.sample_count(&node.id).unwrap(), 3);
    }

    #[tokio::test]
    async fn single_success_recovers_a_down_node() {
        let store = store();
        let down_url = spawn_stub_server(vec![503]).await;
        let mut node = test_node("u1", "API");
        node.endpoint_url = down_url;
        node.expected_status_codes = vec![200];
        node.failure_threshold = 3;
        store.create_node(&node).unwrap();

        for _ in 0..3 {
            let fresh = store.get_node(&node.id).unwrap();
            run_tick(&store, &fresh).await;
        }
        assert_eq!(store.get_node(&node.id).unwrap().status, NodeStatus::Down);

        // Point the node at a healthy endpoint; the next tick re-reads it.
        let ok_url = spawn_stub_server(vec![200]).await;
        let mut fresh = store.get_node(&node.id).unwrap();
        fresh.endpoint_url = ok_url;
        store.update_node(&fresh).unwrap();

        let fresh = store.get_node(&node.id).unwrap();
        run_tick(&store, &fresh).await;

        let fresh = store.get_node(&node.id).unwrap();
        assert_eq!(fresh.status, NodeStatus::Active);
        assert_eq!(fresh.consecutive_failures, 0);
        let newest = &store.list_by_node(&node.id, 1).unwrap()[0];
        assert!(newest.success);
    }

    #[tokio::test]
    async fn sample_survives_node_deleted_mid_probe() {
        let store = store();
        let url = spawn_stub_server(vec![200]).await;
        let mut node = test_node("u1", "API");
        node.endpoint_url = url;
        store.create_node(&node).unwrap();

        // Simulate the delete racing the in-flight probe.
        store.delete_node(&node.id).unwrap();
        run_tick(&store, &node).await;

        assert_eq!(store.sample_count(&node.id).unwrap(), 1);
    }
}
