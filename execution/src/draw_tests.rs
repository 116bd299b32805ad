//! Draw resolver tests: fairness, stock, pool validation and lock retries.

#[cfg(test)]
mod tests {
    use crate::backoff::{BackoffPolicy, RetryPolicy};
    use crate::draw::DrawResolver;
    use crate::metrics::EconomyMetrics;
    use crate::store::testing::{test_store, test_store_with, TestStore};
    use crate::store::StoreConfig;
    use crate::EconomyError;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rusqlite::{Connection, TransactionBehavior};
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use vaultline_types::{ItemSpec, PoolSpec, Reward, ROULETTE_SLOT_COUNT};

    fn resolver(ts: &TestStore) -> (DrawResolver, Arc<EconomyMetrics>) {
        let metrics = Arc::new(EconomyMetrics::default());
        let resolver = DrawResolver::new(ts.store.clone(), metrics.clone(), RetryPolicy::default());
        (resolver, metrics)
    }

    fn points(amount: u64) -> Reward {
        Reward::Points { amount }
    }

    #[test]
    fn test_selection_frequency_follows_weights() {
        let ts = test_store();
        let (resolver, metrics) = resolver(&ts);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "A", &points(10), 1, None).expect("A");
        resolver.add_item("lotto", "B", &points(20), 0, None).expect("B");
        resolver.add_item("lotto", "C", &points(30), 3, None).expect("C");

        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<String, u32> = HashMap::new();
        let draws = 4_000;
        for _ in 0..draws {
            let outcome = resolver.resolve("lotto", &mut rng).expect("draw");
            *counts.entry(outcome.item.label).or_default() += 1;
        }

        let a = counts.get("A").copied().unwrap_or(0);
        let b = counts.get("B").copied().unwrap_or(0);
        let c = counts.get("C").copied().unwrap_or(0);
        assert_eq!(b, 0);
        assert_eq!(a + c, draws);
        let share_a = f64::from(a) / f64::from(draws);
        assert!((share_a - 0.25).abs() < 0.03, "A share {share_a}");
        let ratio = f64::from(c) / f64::from(a);
        assert!((2.5..3.5).contains(&ratio), "C/A ratio {ratio}");
        assert_eq!(metrics.snapshot().draws, u64::from(draws));
    }

    #[test]
    fn test_finite_stock_is_selected_at_most_stock_times() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        resolver.upsert_pool("lotto", None).expect("pool");
        let hoodie = resolver
            .add_item("lotto", "hoodie", &Reward::Item { sku: "HOODIE".to_string(), quantity: 1 }, 1_000, Some(2))
            .expect("hoodie");
        resolver.add_item("lotto", "miss", &Reward::Nothing, 1, None).expect("miss");

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut hoodies = 0;
        for _ in 0..50 {
            let outcome = resolver.resolve("lotto", &mut rng).expect("draw");
            if outcome.item.id == hoodie.id {
                hoodies += 1;
            }
        }
        assert_eq!(hoodies, 2);
        let items = resolver.items("lotto").expect("items");
        assert_eq!(items[0].stock, Some(0));
    }

    #[test]
    fn test_exhausted_pool_is_invalid_config() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "last", &points(1), 1, Some(1)).expect("item");

        let mut rng = StdRng::seed_from_u64(1);
        resolver.resolve("lotto", &mut rng).expect("first draw");
        assert!(matches!(
            resolver.resolve("lotto", &mut rng),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_concurrent_draws_never_oversell_stock() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "ticket", &points(1), 1, Some(5)).expect("item");

        let workers = 10;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers as u64)
            .map(|seed| {
                let resolver = resolver.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    barrier.wait();
                    resolver.resolve("lotto", &mut rng)
                })
            })
            .collect();

        let mut won = 0;
        for handle in handles {
            match handle.join().expect("join") {
                Ok(_) => won += 1,
                Err(EconomyError::InvalidConfig(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(won, 5);
        assert_eq!(resolver.items("lotto").expect("items")[0].stock, Some(0));
    }

    #[test]
    fn test_fixed_slot_pool_requires_exact_active_count() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        resolver
            .upsert_pool("wheel", Some(ROULETTE_SLOT_COUNT))
            .expect("pool");
        let mut ids = Vec::new();
        for slot in 0..ROULETTE_SLOT_COUNT - 1 {
            let item = resolver
                .add_item("wheel", &format!("slot-{slot}"), &points(u64::from(slot)), 1, None)
                .expect("slot");
            ids.push(item.id);
        }

        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            resolver.resolve("wheel", &mut rng),
            Err(EconomyError::InvalidConfig(_))
        ));

        resolver.add_item("wheel", "slot-last", &points(100), 1, None).expect("slot");
        resolver.resolve("wheel", &mut rng).expect("six slots");

        resolver.set_item_active(ids[0], false).expect("deactivate");
        assert!(matches!(
            resolver.resolve("wheel", &mut rng),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stored_negative_weight_blocks_draw() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "ok", &points(1), 5, None).expect("item");
        ts.store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO draw_items
                     (pool_id, label, reward_kind, reward_amount, weight, stock, active, updated_at_ms)
                     VALUES ('lotto', 'bad', 'POINTS', 1, -2, NULL, 1, 0)",
                    [],
                )?;
                Ok(())
            })
            .expect("insert");

        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            resolver.resolve("lotto", &mut rng),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_admin_rejects_bad_items_and_unknown_pools() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            resolver.resolve("missing", &mut rng),
            Err(EconomyError::UnknownPool(_))
        ));
        assert!(matches!(
            resolver.add_item("missing", "x", &points(1), 1, None),
            Err(EconomyError::UnknownPool(_))
        ));
        resolver.upsert_pool("lotto", None).expect("pool");
        assert!(matches!(
            resolver.add_item("lotto", "x", &points(1), -1, None),
            Err(EconomyError::InvalidConfig(_))
        ));
        assert!(matches!(
            resolver.add_item("lotto", "x", &points(1), 1, Some(-1)),
            Err(EconomyError::InvalidConfig(_))
        ));
        assert!(matches!(
            resolver.set_item_stock(999, Some(1)),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_pool_spec_replaces_active_items() {
        let ts = test_store();
        let (resolver, _) = resolver(&ts);
        let spec = |labels: &[&str]| PoolSpec {
            id: "lotto".to_string(),
            slot_count: None,
            items: labels
                .iter()
                .map(|label| ItemSpec {
                    label: label.to_string(),
                    reward_kind: "DIAMOND".to_string(),
                    reward_amount: 1,
                    weight: 1,
                    stock: None,
                })
                .collect(),
        };

        resolver.load_pool_spec(&spec(&["old"])).expect("first load");
        let loaded = resolver.load_pool_spec(&spec(&["new-a", "new-b"])).expect("reload");
        assert_eq!(loaded.len(), 2);

        let items = resolver.items("lotto").expect("items");
        assert_eq!(items.len(), 3);
        assert!(!items[0].active);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let outcome = resolver.resolve("lotto", &mut rng).expect("draw");
            assert_ne!(outcome.item.label, "old");
        }

        let mut bad = spec(&["x"]);
        bad.items[0].reward_kind = "GEMS".to_string();
        assert!(matches!(
            resolver.load_pool_spec(&bad),
            Err(EconomyError::InvalidRequest(_))
        ));
        assert_eq!(resolver.items("lotto").expect("items").len(), 3);
    }

    fn contended_resolver(ts: &TestStore, max_attempts: u32) -> (DrawResolver, Arc<EconomyMetrics>) {
        let metrics = Arc::new(EconomyMetrics::default());
        let retry = RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(20)),
            jitter: false,
        };
        (DrawResolver::new(ts.store.clone(), metrics.clone(), retry), metrics)
    }

    #[test]
    fn test_lock_contention_surfaces_after_retry_budget() {
        let ts = test_store_with(StoreConfig {
            lock_timeout: Duration::from_millis(20),
            max_idle_connections: 4,
        });
        let (resolver, metrics) = contended_resolver(&ts, 2);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "A", &points(1), 1, None).expect("item");

        let mut holder = Connection::open(ts.store.path()).expect("holder");
        let held = holder
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .expect("hold lock");

        let mut rng = StdRng::seed_from_u64(1);
        let err = resolver.resolve("lotto", &mut rng).expect_err("contended");
        assert!(matches!(err, EconomyError::LockNotAcquired { attempts: 2 }));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.draw_lock_retries, 1);
        assert_eq!(snapshot.draw_lock_failures, 1);
        held.rollback().expect("release");
    }

    #[test]
    fn test_draw_succeeds_once_lock_is_released() {
        let ts = test_store_with(StoreConfig {
            lock_timeout: Duration::from_millis(20),
            max_idle_connections: 4,
        });
        let (resolver, metrics) = contended_resolver(&ts, 20);
        resolver.upsert_pool("lotto", None).expect("pool");
        resolver.add_item("lotto", "A", &points(1), 1, None).expect("item");

        let path = ts.store.path().to_path_buf();
        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = thread::spawn(move || {
            let mut conn = Connection::open(path).expect("holder");
            let held = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .expect("hold lock");
            locked_tx.send(()).expect("signal");
            thread::sleep(Duration::from_millis(100));
            held.rollback().expect("release");
        });
        locked_rx.recv().expect("lock held");

        let mut rng = StdRng::seed_from_u64(1);
        let outcome = resolver.resolve("lotto", &mut rng).expect("eventually drawn");
        holder.join().expect("join");
        assert!(outcome.attempts > 1);
        assert_eq!(u64::from(outcome.attempts - 1), metrics.snapshot().draw_lock_retries);
    }
}
