//! Weighted draws over roulette segments and lottery prizes.
//!
//! A draw loads the pool's active items, picks one and decrements finite stock
//! inside one immediate transaction, so draws on a pool are serialized and can
//! never observe a stock level another draw is about to change. Lock timeouts
//! are retried under the configured [`RetryPolicy`].

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use vaultline_types::{DrawPool, PoolSpec, Reward, WeightedItem};

use crate::backoff::RetryPolicy;
use crate::metrics::EconomyMetrics;
use crate::store::Store;
use crate::EconomyError;

/// The selected item (stock as it was before this draw) and how many attempts
/// the draw took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawOutcome {
    pub item: WeightedItem,
    pub attempts: u32,
}

/// Pick one item with probability `weight / total_weight`.
///
/// Items are assumed to be already filtered to active, in-stock rows. A
/// negative weight or a non-positive total is [`EconomyError::InvalidConfig`].
pub fn pick_weighted<'a, R: Rng>(
    items: &'a [WeightedItem],
    rng: &mut R,
) -> Result<&'a WeightedItem, EconomyError> {
    let mut total: u64 = 0;
    for item in items {
        let weight = u64::try_from(item.weight).map_err(|_| {
            EconomyError::InvalidConfig(format!(
                "item {} ({}) has negative weight {}",
                item.id, item.label, item.weight
            ))
        })?;
        total = total
            .checked_add(weight)
            .ok_or_else(|| EconomyError::InvalidConfig("total weight overflows".to_string()))?;
    }
    if total == 0 {
        return Err(EconomyError::InvalidConfig(
            "pool has no positive weight".to_string(),
        ));
    }

    // Equivalent to drawing uniformly from a list where each item appears
    // `weight` times.
    let target = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for item in items {
        cumulative += item.weight as u64;
        if target < cumulative {
            return Ok(item);
        }
    }
    Err(EconomyError::InvalidConfig(
        "weighted pick fell outside the pool".to_string(),
    ))
}

#[derive(Clone)]
pub struct DrawResolver {
    store: Arc<Store>,
    metrics: Arc<EconomyMetrics>,
    retry: RetryPolicy,
}

impl DrawResolver {
    pub fn new(store: Arc<Store>, metrics: Arc<EconomyMetrics>, retry: RetryPolicy) -> Self {
        Self {
            store,
            metrics,
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Create or reconfigure a pool.
    pub fn upsert_pool(
        &self,
        pool_id: &str,
        slot_count: Option<u32>,
    ) -> Result<DrawPool, EconomyError> {
        let now_ms = self.store.now_ms();
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO draw_pools (pool_id, slot_count, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(pool_id) DO UPDATE
                 SET slot_count = excluded.slot_count, updated_at_ms = excluded.updated_at_ms",
                params![pool_id, slot_count, now_ms],
            )?;
            Ok(())
        })?;
        Ok(DrawPool {
            id: pool_id.to_string(),
            slot_count,
        })
    }

    pub fn add_item(
        &self,
        pool_id: &str,
        label: &str,
        reward: &Reward,
        weight: i64,
        stock: Option<i64>,
    ) -> Result<WeightedItem, EconomyError> {
        validate_item(label, weight, stock)?;
        let now_ms = self.store.now_ms();
        let id = self.store.write(|tx| {
            ensure_pool(tx, pool_id)?;
            insert_item(tx, pool_id, label, reward, weight, stock, now_ms)
        })?;
        Ok(WeightedItem {
            id,
            pool_id: pool_id.to_string(),
            label: label.to_string(),
            reward: reward.clone(),
            weight,
            stock,
            active: true,
        })
    }

    pub fn set_item_active(&self, item_id: u64, active: bool) -> Result<(), EconomyError> {
        self.update_item(
            item_id,
            "UPDATE draw_items SET active = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![active, self.store.now_ms(), item_id],
        )
    }

    pub fn set_item_stock(&self, item_id: u64, stock: Option<i64>) -> Result<(), EconomyError> {
        if matches!(stock, Some(stock) if stock < 0) {
            return Err(EconomyError::InvalidConfig(format!(
                "item {item_id} stock must not be negative"
            )));
        }
        self.update_item(
            item_id,
            "UPDATE draw_items SET stock = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![stock, self.store.now_ms(), item_id],
        )
    }

    /// Give back one unit of finite stock taken by a draw whose play did not
    /// go through.
    pub fn release_stock(&self, item_id: u64) -> Result<(), EconomyError> {
        let now_ms = self.store.now_ms();
        self.store.write(|tx| {
            tx.execute(
                "UPDATE draw_items SET stock = stock + 1, updated_at_ms = ?1
                 WHERE id = ?2 AND stock IS NOT NULL",
                params![now_ms, item_id],
            )?;
            Ok(())
        })
    }

    fn update_item(
        &self,
        item_id: u64,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<(), EconomyError> {
        self.store.write(|tx| {
            if tx.execute(sql, params)? == 0 {
                return Err(EconomyError::InvalidConfig(format!(
                    "draw item {item_id} does not exist"
                )));
            }
            Ok(())
        })
    }

    /// Replace a pool's configuration: existing items are deactivated and the
    /// spec's items inserted, atomically.
    pub fn load_pool_spec(&self, spec: &PoolSpec) -> Result<Vec<WeightedItem>, EconomyError> {
        let mut items = Vec::with_capacity(spec.items.len());
        for item in &spec.items {
            validate_item(&item.label, item.weight, item.stock)?;
            let reward = Reward::from_descriptor(&item.reward_kind, item.reward_amount)?;
            items.push((item, reward));
        }
        let now_ms = self.store.now_ms();
        let loaded = self.store.write(|tx| {
            tx.execute(
                "INSERT INTO draw_pools (pool_id, slot_count, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(pool_id) DO UPDATE
                 SET slot_count = excluded.slot_count, updated_at_ms = excluded.updated_at_ms",
                params![spec.id, spec.slot_count, now_ms],
            )?;
            tx.execute(
                "UPDATE draw_items SET active = 0, updated_at_ms = ?1 WHERE pool_id = ?2",
                params![now_ms, spec.id],
            )?;
            let mut loaded = Vec::with_capacity(items.len());
            for (item, reward) in &items {
                let id = insert_item(
                    tx,
                    &spec.id,
                    &item.label,
                    reward,
                    item.weight,
                    item.stock,
                    now_ms,
                )?;
                loaded.push(WeightedItem {
                    id,
                    pool_id: spec.id.clone(),
                    label: item.label.clone(),
                    reward: reward.clone(),
                    weight: item.weight,
                    stock: item.stock,
                    active: true,
                });
            }
            Ok(loaded)
        })?;
        info!(pool = %spec.id, items = loaded.len(), slot_count = ?spec.slot_count, "draw pool loaded");
        Ok(loaded)
    }

    pub fn pool(&self, pool_id: &str) -> Result<Option<DrawPool>, EconomyError> {
        self.store.read(|conn| load_pool(conn, pool_id))
    }

    /// Every item of the pool, active or not, in insertion order.
    pub fn items(&self, pool_id: &str) -> Result<Vec<WeightedItem>, EconomyError> {
        self.store.read(|conn| load_items(conn, pool_id, false))
    }

    /// Draw one item, retrying lock timeouts with backoff.
    ///
    /// Exhausting the retry budget surfaces [`EconomyError::LockNotAcquired`].
    pub fn resolve<R: Rng>(&self, pool_id: &str, rng: &mut R) -> Result<DrawOutcome, EconomyError> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.try_resolve(pool_id, rng) {
                Ok(item) => {
                    self.metrics.inc_draws();
                    debug!(pool = pool_id, item = item.id, label = %item.label, attempt, "draw resolved");
                    return Ok(DrawOutcome {
                        item,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_lock_contention() => {
                    if attempt >= attempts {
                        self.metrics.inc_draw_lock_failures();
                        warn!(pool = pool_id, attempts, "draw lock not acquired; giving up");
                        return Err(EconomyError::LockNotAcquired { attempts });
                    }
                    let delay = self.retry.delay(rng, attempt);
                    self.metrics.inc_draw_lock_retries();
                    warn!(pool = pool_id, attempt, ?delay, "draw lock contention; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_resolve<R: Rng>(&self, pool_id: &str, rng: &mut R) -> Result<WeightedItem, EconomyError> {
        let now_ms = self.store.now_ms();
        self.store.write(|tx| {
            let pool = load_pool(tx, pool_id)?
                .ok_or_else(|| EconomyError::UnknownPool(pool_id.to_string()))?;
            let active = load_items(tx, pool_id, true)?;
            if let Some(slot_count) = pool.slot_count {
                if active.len() != slot_count as usize {
                    return Err(EconomyError::InvalidConfig(format!(
                        "pool {pool_id} needs exactly {slot_count} active items, found {}",
                        active.len()
                    )));
                }
            }
            let available: Vec<WeightedItem> =
                active.into_iter().filter(WeightedItem::in_stock).collect();
            let chosen = pick_weighted(&available, rng)?.clone();
            if chosen.stock.is_some() {
                let updated = tx.execute(
                    "UPDATE draw_items SET stock = stock - 1, updated_at_ms = ?1
                     WHERE id = ?2 AND stock > 0",
                    params![now_ms, chosen.id],
                )?;
                if updated != 1 {
                    return Err(EconomyError::InvalidConfig(format!(
                        "item {} ran out of stock mid-draw",
                        chosen.id
                    )));
                }
            }
            Ok(chosen)
        })
    }
}

fn validate_item(label: &str, weight: i64, stock: Option<i64>) -> Result<(), EconomyError> {
    if weight < 0 {
        return Err(EconomyError::InvalidConfig(format!(
            "item {label} has negative weight {weight}"
        )));
    }
    if matches!(stock, Some(stock) if stock < 0) {
        return Err(EconomyError::InvalidConfig(format!(
            "item {label} has negative stock"
        )));
    }
    Ok(())
}

fn ensure_pool(conn: &Connection, pool_id: &str) -> Result<(), EconomyError> {
    match load_pool(conn, pool_id)? {
        Some(_) => Ok(()),
        None => Err(EconomyError::UnknownPool(pool_id.to_string())),
    }
}

fn insert_item(
    conn: &Connection,
    pool_id: &str,
    label: &str,
    reward: &Reward,
    weight: i64,
    stock: Option<i64>,
    now_ms: u64,
) -> Result<u64, EconomyError> {
    let (reward_kind, reward_amount) = reward.descriptor();
    conn.execute(
        "INSERT INTO draw_items
         (pool_id, label, reward_kind, reward_amount, weight, stock, active, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        params![pool_id, label, reward_kind, reward_amount, weight, stock, now_ms],
    )?;
    Ok(conn.last_insert_rowid() as u64)
}

fn load_pool(conn: &Connection, pool_id: &str) -> Result<Option<DrawPool>, EconomyError> {
    Ok(conn
        .query_row(
            "SELECT slot_count FROM draw_pools WHERE pool_id = ?1",
            params![pool_id],
            |row| row.get::<_, Option<u32>>(0),
        )
        .optional()?
        .map(|slot_count| DrawPool {
            id: pool_id.to_string(),
            slot_count,
        }))
}

fn load_items(
    conn: &Connection,
    pool_id: &str,
    active_only: bool,
) -> Result<Vec<WeightedItem>, EconomyError> {
    let mut stmt = conn.prepare(
        "SELECT id, label, reward_kind, reward_amount, weight, stock, active
         FROM draw_items WHERE pool_id = ?1 AND (active = 1 OR ?2 = 0) ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![pool_id, active_only], |row| {
        Ok((
            row.get::<_, u64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, u64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, bool>(6)?,
        ))
    })?;
    let mut items = Vec::new();
    for row in rows {
        let (id, label, reward_kind, reward_amount, weight, stock, active) = row?;
        items.push(WeightedItem {
            id,
            pool_id: pool_id.to_string(),
            label,
            reward: Reward::from_descriptor(&reward_kind, reward_amount)?,
            weight,
            stock,
            active,
        });
    }
    Ok(items)
}
