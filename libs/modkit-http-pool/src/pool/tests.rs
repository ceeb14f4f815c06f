use super::*;
use crate::config::PoolConfig;
use crate::error::FailureKind;
use async_trait::async_trait;
use std::sync::atomic::AtomicU64;

/// Counters shared by every connection a [`FakeConnector`] hands out.
#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    drops: AtomicUsize,
    fail_next: AtomicBool,
}

struct FakeConn {
    serial: u64,
    open: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Poolable for FakeConn {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.counters.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    counters: Arc<Counters>,
    serial: AtomicU64,
    last_open_flag: Mutex<Option<Arc<AtomicBool>>>,
}

#[async_trait]
impl Connect for FakeConnector {
    type Connection = FakeConn;

    async fn connect(&self, _destination: &Destination) -> Result<FakeConn, HttpError> {
        if self.counters.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HttpError::transport(FailureKind::Io, "connection refused"));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        *self.last_open_flag.lock() = Some(Arc::clone(&open));
        Ok(FakeConn {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            open,
            counters: Arc::clone(&self.counters),
        })
    }
}

fn pool_with(config: PoolConfig) -> (ConnectionPool<FakeConnector>, Arc<Counters>) {
    let connector = FakeConnector::default();
    let counters = Arc::clone(&connector.counters);
    (ConnectionPool::new(connector, config.effective()), counters)
}

fn dest(host: &str) -> Destination {
    Destination::new(Scheme::Http, host, 80)
}

#[tokio::test]
async fn test_release_then_acquire_reuses_connection() {
    let (pool, counters) = pool_with(PoolConfig::default());
    let a = dest("a");

    let conn = pool.acquire(&a).await.unwrap();
    let id = conn.id();
    let serial = conn.serial;
    conn.release();

    let again = pool.acquire(&a).await.unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(again.serial, serial);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connections_are_not_shared_across_destinations() {
    let (pool, counters) = pool_with(PoolConfig::default());

    pool.acquire(&dest("a")).await.unwrap().release();
    let other = pool.acquire(&dest("b")).await.unwrap();
    assert_eq!(other.id(), 2);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropping_lease_destroys_connection() {
    let (pool, counters) = pool_with(PoolConfig::default());

    let conn = pool.acquire(&dest("a")).await.unwrap();
    assert_eq!(pool.stats().leased, 1);
    drop(conn);

    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test]
async fn test_closed_connection_is_not_reused() {
    let (pool, counters) = pool_with(PoolConfig::default());
    let a = dest("a");

    pool.acquire(&a).await.unwrap().release();
    let flag = pool.connector().last_open_flag.lock().clone().unwrap();
    flag.store(false, Ordering::SeqCst);

    let conn = pool.acquire(&a).await.unwrap();
    assert_eq!(conn.id(), 2);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_connect_frees_slot() {
    let (pool, counters) = pool_with(PoolConfig::default().with_max_total(1));
    counters.fail_next.store(true, Ordering::SeqCst);

    let err = pool.acquire(&dest("a")).await.err().unwrap();
    assert_eq!(err.failure_kind(), Some(FailureKind::Io));
    assert_eq!(pool.stats().total, 0);

    let conn = pool.acquire(&dest("a")).await.unwrap();
    assert_eq!(conn.id(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caps_hold_under_concurrent_load() {
    const PER_DESTINATION: usize = 3;
    const TOTAL: usize = 5;

    let (pool, _counters) = pool_with(
        PoolConfig::default()
            .with_max_per_destination(3)
            .with_max_total(5)
            .with_acquire_timeout_ms(10_000),
    );
    let pool = Arc::new(pool);
    let destinations = [dest("a"), dest("b"), dest("c")];
    let in_use: Arc<[AtomicUsize; 3]> = Arc::new(std::array::from_fn(|_| AtomicUsize::new(0)));
    let max_seen: Arc<[AtomicUsize; 3]> = Arc::new(std::array::from_fn(|_| AtomicUsize::new(0)));
    let total_in_use = Arc::new(AtomicUsize::new(0));
    let max_total_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..60 {
        let pool = Arc::clone(&pool);
        let slot = i % destinations.len();
        let destination = destinations[slot].clone();
        let in_use = Arc::clone(&in_use);
        let max_seen = Arc::clone(&max_seen);
        let total_in_use = Arc::clone(&total_in_use);
        let max_total_seen = Arc::clone(&max_total_seen);

        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire(&destination).await.unwrap();

            let now = in_use[slot].fetch_add(1, Ordering::SeqCst) + 1;
            max_seen[slot].fetch_max(now, Ordering::SeqCst);
            let total = total_in_use.fetch_add(1, Ordering::SeqCst) + 1;
            max_total_seen.fetch_max(total, Ordering::SeqCst);

            let stats = pool.stats();
            assert!(stats.total <= TOTAL, "total {} exceeds cap", stats.total);
            assert!(
                stats.per_destination.values().all(|&n| n <= PER_DESTINATION),
                "per-destination cap exceeded: {:?}",
                stats.per_destination
            );

            tokio::time::sleep(Duration::from_millis(2)).await;

            in_use[slot].fetch_sub(1, Ordering::SeqCst);
            total_in_use.fetch_sub(1, Ordering::SeqCst);
            conn.release();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    for seen in &*max_seen {
        assert!(seen.load(Ordering::SeqCst) <= PER_DESTINATION);
    }
    assert!(max_total_seen.load(Ordering::SeqCst) <= TOTAL);
    assert!(pool.stats().total <= TOTAL);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test(start_paused = true)]
async fn test_third_caller_gets_released_connection() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_max_total(2)
            .with_max_per_destination(2)
            .with_acquire_timeout_ms(100),
    );
    let pool = Arc::new(pool);
    let a = dest("a");

    let first = pool.acquire(&a).await.unwrap();
    let second = pool.acquire(&a).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        let a = a.clone();
        tokio::spawn(async move { pool.acquire(&a).await.map(|c| c.id()) })
    };

    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    tokio::time::advance(Duration::from_millis(50)).await;
    let released_id = first.id();
    first.release();

    let id = waiter.await.unwrap().unwrap();
    assert_eq!(id, released_id);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn test_third_caller_times_out_when_nothing_released() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_max_total(2)
            .with_max_per_destination(2)
            .with_acquire_timeout_ms(100),
    );
    let a = dest("a");

    let _first = pool.acquire(&a).await.unwrap();
    let _second = pool.acquire(&a).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(&a).await.err().unwrap();

    match err {
        HttpError::PoolExhausted {
            destination,
            waited,
        } => {
            assert_eq!(destination, "http://a:80");
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_total_cap_evicts_other_destinations_idle_connection() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_max_total(2)
            .with_max_per_destination(2)
            .with_acquire_timeout_ms(50),
    );

    pool.acquire(&dest("a")).await.unwrap().release();
    let _b1 = pool.acquire(&dest("b")).await.unwrap();
    let _b2 = pool.acquire(&dest("b")).await.unwrap();

    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.per_destination.get(&dest("a")), None);
}

#[tokio::test(start_paused = true)]
async fn test_close_expired_removes_connections_past_lifetime() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_max_lifetime_ms(1_000)
            .with_keep_alive_ms(3_600_000)
            .with_max_idle_ms(3_600_000),
    );
    let a = dest("a");

    pool.acquire(&a).await.unwrap().release();
    assert_eq!(pool.close_expired().unwrap(), 0);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert_eq!(pool.close_expired().unwrap(), 1);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_never_returns_connection_past_lifetime() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_max_lifetime_ms(1_000)
            .with_keep_alive_ms(3_600_000),
    );
    let a = dest("a");

    pool.acquire(&a).await.unwrap().release();
    tokio::time::advance(Duration::from_millis(1_500)).await;

    let conn = pool.acquire(&a).await.unwrap();
    assert_eq!(conn.id(), 2);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_destroys_connection_past_lifetime() {
    let (pool, counters) = pool_with(PoolConfig::default().with_max_lifetime_ms(1_000));

    let conn = pool.acquire(&dest("a")).await.unwrap();
    tokio::time::advance(Duration::from_millis(1_500)).await;
    conn.release();

    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_window_limits_reuse() {
    let (pool, counters) = pool_with(PoolConfig::default());
    let a = dest("a");

    let mut conn = pool.acquire(&a).await.unwrap();
    conn.set_keep_alive(Duration::from_millis(100));
    conn.release();

    tokio::time::advance(Duration::from_millis(150)).await;
    assert_eq!(pool.close_expired().unwrap(), 1);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_idle_only_touches_long_idle_connections() {
    let (pool, counters) = pool_with(PoolConfig::default());

    pool.acquire(&dest("a")).await.unwrap().release();
    tokio::time::advance(Duration::from_secs(40)).await;
    pool.acquire(&dest("b")).await.unwrap().release();
    tokio::time::advance(Duration::from_secs(30)).await;

    assert_eq!(pool.close_idle(Duration::from_secs(60)).unwrap(), 1);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert!(stats.per_destination.contains_key(&dest("b")));
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_evictor_destroys_idle_connection_exactly_once() {
    let (pool, counters) = pool_with(
        PoolConfig::default()
            .with_eviction_interval_ms(30_000)
            .with_max_idle_ms(45_000)
            .with_keep_alive_ms(3_600_000)
            .with_max_lifetime_ms(3_600_000),
    );

    pool.acquire(&dest("a")).await.unwrap().release();
    pool.start_eviction().unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(counters.drops.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(90)).await;
    settle().await;
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.evictor_state(), EvictorState::Running);

    pool.shutdown();
    assert_eq!(pool.evictor_state(), EvictorState::Stopped);
}

#[tokio::test]
async fn test_start_eviction_twice_is_ignored() {
    let (pool, _counters) = pool_with(PoolConfig::default());
    pool.start_eviction().unwrap();
    pool.start_eviction().unwrap();
    assert_eq!(pool.evictor_state(), EvictorState::Running);
}

#[tokio::test]
async fn test_shutdown_destroys_connections_and_rejects_acquire() {
    let (pool, counters) = pool_with(PoolConfig::default());
    let a = dest("a");

    pool.acquire(&a).await.unwrap().release();
    let leased = pool.acquire(&dest("b")).await.unwrap();

    pool.shutdown();
    assert!(pool.is_closed());
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    assert!(matches!(pool.acquire(&a).await, Err(HttpError::PoolClosed)));
    assert!(matches!(pool.close_expired(), Err(HttpError::PoolClosed)));
    assert!(matches!(
        pool.close_idle(Duration::ZERO),
        Err(HttpError::PoolClosed)
    ));

    // leased connections are destroyed once handed back
    leased.release();
    assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().total, 0);

    // idempotent
    pool.shutdown();
    assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_waiters() {
    let (pool, _counters) = pool_with(
        PoolConfig::default()
            .with_max_total(1)
            .with_acquire_timeout_ms(60_000),
    );
    let pool = Arc::new(pool);
    let _held = pool.acquire(&dest("a")).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&dest("a")).await.map(|c| c.id()) })
    };
    settle().await;

    pool.shutdown();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(HttpError::PoolClosed)));
}

#[tokio::test]
async fn test_shared_pool_survives_non_last_holder_shutdown() {
    let (owner, counters) = pool_with(PoolConfig::default().with_shared(true));
    let a = dest("a");
    let other = owner.clone();

    owner.acquire(&a).await.unwrap().release();
    owner.shutdown();

    assert!(owner.is_closed());
    assert!(matches!(owner.acquire(&a).await, Err(HttpError::PoolClosed)));
    assert!(!other.is_closed());
    assert_eq!(counters.drops.load(Ordering::SeqCst), 0);

    let conn = other.acquire(&a).await.unwrap();
    assert_eq!(conn.id(), 1);
    conn.release();

    other.shutdown();
    assert!(other.is_closed());
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_shared_pool_shutdown_tears_down_for_all_holders() {
    let (owner, counters) = pool_with(PoolConfig::default());
    let other = owner.clone();

    owner.acquire(&dest("a")).await.unwrap().release();
    owner.shutdown();

    assert!(other.is_closed());
    assert!(matches!(
        other.acquire(&dest("a")).await,
        Err(HttpError::PoolClosed)
    ));
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_last_holder_tears_down() {
    let (owner, counters) = pool_with(PoolConfig::default());
    let other = owner.clone();

    owner.acquire(&dest("a")).await.unwrap().release();
    drop(owner);
    assert!(!other.is_closed());
    assert_eq!(counters.drops.load(Ordering::SeqCst), 0);

    drop(other);
    assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
}
