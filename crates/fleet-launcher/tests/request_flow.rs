//! End-to-end request handling against the in-process provider.
//!
//! Exercises the handler state machine, decline convergence between
//! several launchers, failure and abandonment paths, and the pool worker
//! loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_launcher::*;
use fleet_state::*;

fn provider() -> Arc<FakeProvider> {
    let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
    provider.start().unwrap();
    provider
}

fn pool_ctx(
    store: &StateStore,
    provider: &Arc<FakeProvider>,
    launcher_id: &str,
    max_servers: u32,
) -> PoolContext {
    let session = store.open_session();
    store.register_launcher(launcher_id, &session);
    PoolContext {
        launcher_id: launcher_id.to_string(),
        store: store.clone(),
        session,
        provider: Arc::new(ProviderConfig {
            name: "fake".into(),
            driver: "fake".into(),
            rate: 100.0,
            max_concurrency: None,
            launch_retries: 1,
            pools: Vec::new(),
        }),
        pool: Arc::new(PoolConfig {
            name: "main".into(),
            max_servers,
            labels: vec!["small".into(), "large".into(), "broken".into()],
        }),
        manager: provider.clone(),
        launcher: provider.clone(),
        launches: LaunchCounter::new(),
    }
}

fn submit(store: &StateStore, labels: &[&str]) -> NodeRequest {
    let mut request = NodeRequest::new("zuul", labels.iter().map(|s| s.to_string()).collect());
    store.create_request(&mut request).unwrap();
    request
}

fn handler(ctx: &PoolContext, request_id: &str, driver: Box<dyn RequestDriver>) -> NodeRequestHandler {
    let request = ctx.store.get_request(request_id).unwrap().unwrap();
    let mut lock = SessionLock::new(ctx.store.request_lock(
        request_id,
        &ctx.session,
        Some(&ctx.launcher_id),
    ));
    assert!(lock.acquire(false, None, true).unwrap());
    NodeRequestHandler::new(ctx.clone(), request, lock, driver)
}

async fn poll_until_done(handler: &mut NodeRequestHandler) {
    for _ in 0..1000 {
        if handler.poll().unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("handler did not finish");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn request_state(store: &StateStore, id: &str) -> RequestState {
    store.get_request(id).unwrap().unwrap().state
}

// ── Handler outcomes ──────────────────────────────────────────────

#[tokio::test]
async fn three_node_request_is_fulfilled() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let request = submit(&store, &["small", "large", "small"]);

    let mut h = handler(&ctx, &request.id, Box::new(StandardDriver));
    h.run().unwrap();
    poll_until_done(&mut h).await;

    let stored = store.get_request(&request.id).unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Fulfilled);
    assert_eq!(stored.nodes.len(), 3);
    assert_eq!(h.ready_nodes().len(), 3);
    assert_eq!(h.alive_task_count(), 0);

    // Node ids follow label_set order.
    let labels: Vec<String> = stored
        .nodes
        .iter()
        .map(|id| store.get_node(id).unwrap().unwrap().label)
        .collect();
    assert_eq!(labels, vec!["small", "large", "small"]);

    for id in &stored.nodes {
        let node = store.get_node(id).unwrap().unwrap();
        assert_eq!(node.state, NodeState::Ready);
        assert_eq!(node.allocated_to.as_deref(), Some(request.id.as_str()));
    }
    assert_eq!(store.locks().held_count(), 0);
}

#[tokio::test]
async fn one_failed_launch_with_two_launchers_resets_request() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.set_label_failing("broken", true);
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let _other = pool_ctx(&store, &provider, "l2", 10);
    let request = submit(&store, &["small", "broken"]);

    let mut h = handler(&ctx, &request.id, Box::new(StandardDriver));
    h.run().unwrap();
    poll_until_done(&mut h).await;

    let stored = store.get_request(&request.id).unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Requested);
    assert_eq!(stored.declined_by, vec!["l1".to_string()]);
    assert!(stored.nodes.is_empty());
    assert_eq!(h.failed_nodes().len(), 1);
    assert!(h.is_done());
    assert_eq!(store.locks().held_count(), 0);
}

#[tokio::test]
async fn request_fails_exactly_at_the_last_decline() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.set_label_failing("broken", true);
    let launchers: Vec<PoolContext> = ["l1", "l2", "l3"]
        .iter()
        .map(|id| pool_ctx(&store, &provider, id, 10))
        .collect();
    let request = submit(&store, &["broken"]);

    for (i, ctx) in launchers.iter().enumerate() {
        assert_ne!(request_state(&store, &request.id), RequestState::Failed);
        let mut h = handler(ctx, &request.id, Box::new(StandardDriver));
        h.run().unwrap();
        poll_until_done(&mut h).await;

        let expected = if i + 1 < launchers.len() {
            RequestState::Requested
        } else {
            RequestState::Failed
        };
        assert_eq!(request_state(&store, &request.id), expected);
    }
    let stored = store.get_request(&request.id).unwrap().unwrap();
    assert_eq!(stored.declined_by, vec!["l1", "l2", "l3"]);
}

#[tokio::test]
async fn late_launcher_does_not_block_convergence() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.set_label_failing("broken", true);
    let l1 = pool_ctx(&store, &provider, "l1", 10);

    // Only l1 is registered when it declines: the request fails, and a
    // launcher registering afterwards does not revive it.
    let failed = submit(&store, &["broken"]);
    let mut h = handler(&l1, &failed.id, Box::new(StandardDriver));
    h.run().unwrap();
    poll_until_done(&mut h).await;
    assert_eq!(request_state(&store, &failed.id), RequestState::Failed);

    let l2 = pool_ctx(&store, &provider, "l2", 10);
    assert_eq!(request_state(&store, &failed.id), RequestState::Failed);

    // With l1 and l2 registered, l3 joining between the declines keeps the
    // request open for l3 instead of failing it.
    let open = submit(&store, &["broken"]);
    let mut h = handler(&l1, &open.id, Box::new(StandardDriver));
    h.run().unwrap();
    poll_until_done(&mut h).await;
    let _l3 = pool_ctx(&store, &provider, "l3", 10);
    let mut h = handler(&l2, &open.id, Box::new(StandardDriver));
    h.run().unwrap();
    poll_until_done(&mut h).await;
    assert_eq!(request_state(&store, &open.id), RequestState::Requested);
}

struct LaunchThenFail;

impl RequestDriver for LaunchThenFail {
    fn run_handler(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        ctx.accept()?;
        ctx.launch_node("small")?;
        ctx.launch_node("small")?;
        anyhow::bail!("quota lookup failed")
    }
}

#[tokio::test]
async fn driver_error_releases_locks_and_allocation() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.hold_launches();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let request = submit(&store, &["small", "small"]);

    let mut h = handler(&ctx, &request.id, Box::new(LaunchThenFail));
    h.run().unwrap();
    assert!(h.is_done());
    assert_eq!(request_state(&store, &request.id), RequestState::Failed);
    assert_eq!(store.locks().held_count(), 0);

    // The launches finish after the handler gave up; the allocation stays
    // cleared.
    provider.release_launches();
    wait_until(|| {
        store
            .list_nodes()
            .unwrap()
            .iter()
            .all(|n| n.state.is_launch_terminal())
    })
    .await;
    let nodes = store.list_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.allocated_to.is_none()));
}

#[tokio::test]
async fn request_deleted_mid_launch_releases_nodes() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.hold_launches();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let request = submit(&store, &["small", "large"]);

    let mut h = handler(&ctx, &request.id, Box::new(StandardDriver));
    h.run().unwrap();
    assert!(!h.poll().unwrap());

    store.delete_request(&request.id).unwrap();
    provider.release_launches();
    poll_until_done(&mut h).await;

    assert!(store.get_request(&request.id).unwrap().is_none());
    let nodes = store.list_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.allocated_to.is_none()));
    assert_eq!(store.locks().held_count(), 0);
}

#[tokio::test]
async fn lost_session_abandons_without_committing() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    provider.hold_launches();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let request = submit(&store, &["small"]);

    let mut h = handler(&ctx, &request.id, Box::new(StandardDriver));
    h.run().unwrap();
    assert_eq!(request_state(&store, &request.id), RequestState::Pending);

    store.expire_session(&ctx.session);
    provider.release_launches();
    poll_until_done(&mut h).await;

    let stored = store.get_request(&request.id).unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Pending);
    assert!(stored.nodes.is_empty());
    // The launch task saw the lost lock and left the record alone.
    let nodes = store.list_nodes().unwrap();
    assert_eq!(nodes[0].state, NodeState::Building);
    assert!(store.registered_launchers().is_empty());
}

// ── Pool worker ───────────────────────────────────────────────────

#[tokio::test]
async fn pool_worker_fulfills_requests() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let mut worker = PoolWorker::standard(pool_ctx(&store, &provider, "l1", 10), Duration::ZERO);
    let first = submit(&store, &["small"]);
    let second = submit(&store, &["large", "large"]);

    for _ in 0..1000 {
        worker.run_once().unwrap();
        if request_state(&store, &first.id) == RequestState::Fulfilled
            && request_state(&store, &second.id) == RequestState::Fulfilled
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(request_state(&store, &first.id), RequestState::Fulfilled);
    assert_eq!(request_state(&store, &second.id), RequestState::Fulfilled);
    assert_eq!(provider.server_count(), 3);

    worker.shutdown();
    assert!(store.registered_launchers().is_empty());
}

#[tokio::test]
async fn pool_worker_pauses_at_max_servers() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let mut worker = PoolWorker::standard(pool_ctx(&store, &provider, "l1", 1), Duration::ZERO);
    let first = submit(&store, &["small"]);

    for _ in 0..1000 {
        worker.run_once().unwrap();
        if request_state(&store, &first.id) == RequestState::Fulfilled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(request_state(&store, &first.id), RequestState::Fulfilled);

    // The pool is full: the next request waits instead of launching.
    let second = submit(&store, &["large"]);
    worker.run_once().unwrap();
    assert!(worker.is_paused());
    assert_eq!(request_state(&store, &second.id), RequestState::Pending);
    assert_eq!(store.list_nodes().unwrap().len(), 1);

    // Capacity frees up once the first node is gone.
    let used = store.get_request(&first.id).unwrap().unwrap().nodes[0].clone();
    store.delete_node(&used).unwrap();
    for _ in 0..1000 {
        worker.run_once().unwrap();
        if request_state(&store, &second.id) == RequestState::Fulfilled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!worker.is_paused());
    assert_eq!(request_state(&store, &second.id), RequestState::Fulfilled);
}

#[tokio::test]
async fn pool_worker_skips_requests_it_declined() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let _other = pool_ctx(&store, &provider, "l2", 10);
    let mut worker = PoolWorker::standard(ctx, Duration::ZERO);
    let request = submit(&store, &["gpu"]);

    worker.run_once().unwrap();
    let stored = store.get_request(&request.id).unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Requested);
    assert_eq!(stored.declined_by, vec!["l1".to_string()]);

    worker.run_once().unwrap();
    assert_eq!(worker.active_handlers(), 0);
    assert_eq!(
        store.get_request(&request.id).unwrap().unwrap().declined_by.len(),
        1
    );
}

#[tokio::test]
async fn pool_worker_idles_while_session_is_suspended() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let ctx = pool_ctx(&store, &provider, "l1", 10);
    let session = ctx.session.clone();
    let mut worker = PoolWorker::standard(ctx, Duration::ZERO);
    let request = submit(&store, &["small"]);

    session.suspend();
    worker.run_once().unwrap();
    assert_eq!(request_state(&store, &request.id), RequestState::Requested);

    session.reconnect();
    worker.run_once().unwrap();
    assert_eq!(request_state(&store, &request.id), RequestState::Pending);
}

#[tokio::test]
async fn pool_worker_run_loop_stops_on_shutdown() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let mut worker =
        PoolWorker::standard(pool_ctx(&store, &provider, "l1", 10), Duration::from_millis(5));
    let request = submit(&store, &["small"]);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move { worker.run(rx).await });

    wait_until(|| request_state(&store, &request.id) == RequestState::Fulfilled).await;
    tx.send(true).unwrap();
    task.await.unwrap();
    assert!(store.registered_launchers().is_empty());
}

#[tokio::test]
async fn max_concurrency_spans_every_pool_of_a_provider() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let launches = LaunchCounter::new();
    let limited = |launcher_id: &str, pool: &str| {
        let mut ctx = pool_ctx(&store, &provider, launcher_id, 10);
        ctx.provider = Arc::new(ProviderConfig {
            max_concurrency: Some(1),
            ..(*ctx.provider).clone()
        });
        ctx.pool = Arc::new(PoolConfig {
            name: pool.into(),
            ..(*ctx.pool).clone()
        });
        ctx.launches = launches.clone();
        ctx
    };
    let mut east = PoolWorker::standard(limited("l1", "east"), Duration::ZERO);
    let mut west = PoolWorker::standard(limited("l2", "west"), Duration::ZERO);

    provider.hold_launches();
    let first = submit(&store, &["small"]);
    let second = submit(&store, &["small"]);

    east.run_once().unwrap();
    west.run_once().unwrap();
    assert_eq!(launches.active(), 1);
    assert_eq!(request_state(&store, &first.id), RequestState::Pending);
    assert_eq!(request_state(&store, &second.id), RequestState::Requested);

    provider.release_launches();
    for _ in 0..1000 {
        east.run_once().unwrap();
        west.run_once().unwrap();
        if request_state(&store, &second.id) == RequestState::Fulfilled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(request_state(&store, &first.id), RequestState::Fulfilled);
    assert_eq!(request_state(&store, &second.id), RequestState::Fulfilled);
    assert_eq!(launches.active(), 0);
}

#[tokio::test]
async fn cleanup_of_orphaned_building_node_unpauses_pool() {
    let store = StateStore::open_in_memory().unwrap();
    let provider = provider();
    let mut worker = PoolWorker::standard(pool_ctx(&store, &provider, "l1", 1), Duration::ZERO);

    // Left behind by a launcher that crashed mid-launch.
    let mut orphan = Node::new("fake", "main", "small");
    orphan.launcher = Some("crashed".into());
    store.create_node(&mut orphan).unwrap();

    let request = submit(&store, &["small"]);
    worker.run_once().unwrap();
    assert!(worker.is_paused());

    let managers: HashMap<String, Arc<dyn ProviderManager>> =
        HashMap::from([("fake".to_string(), provider.clone() as Arc<dyn ProviderManager>)]);
    let cleanup = CleanupWorker::new(store.clone(), store.open_session(), "cleanup", managers);
    assert_eq!(cleanup.run_once().await.unwrap().nodes_deleted, 1);

    for _ in 0..1000 {
        worker.run_once().unwrap();
        if request_state(&store, &request.id) == RequestState::Fulfilled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!worker.is_paused());
    assert_eq!(request_state(&store, &request.id), RequestState::Fulfilled);
}
