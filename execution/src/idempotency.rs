//! Request-level deduplication for externally retried writes.
//!
//! A record is keyed by `(actor, scope, key)` and pinned to the fingerprint of
//! the canonicalized request. The first `begin` inserts it `IN_PROGRESS`; the
//! insert and the lookup run in one immediate transaction, so concurrent
//! identical requests resolve to exactly one winner.

use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use vaultline_types::{Disposition, IdempotencyRecord, IdempotencyStatus};

use crate::metrics::EconomyMetrics;
use crate::store::Store;
use crate::EconomyError;

/// Result of [`IdempotencyGuard::begin`].
#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    /// First sighting of the key: run the side effect, then `complete`.
    Proceed(IdempotencyRecord),
    /// Already completed: replay `response` verbatim, do not re-run.
    Replay {
        record: IdempotencyRecord,
        response: Value,
    },
    /// An identical request is still running.
    InFlight(IdempotencyRecord),
}

/// Result of [`IdempotencyGuard::execute`].
#[derive(Clone, Debug, PartialEq)]
pub enum Execution {
    Executed(Value),
    Replayed(Value),
}

impl Execution {
    pub fn response(&self) -> &Value {
        match self {
            Execution::Executed(response) | Execution::Replayed(response) => response,
        }
    }

    pub fn into_response(self) -> Value {
        match self {
            Execution::Executed(response) | Execution::Replayed(response) => response,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for key in keys {
                    sorted.insert(key.clone(), sort(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Hex-encoded BLAKE3 of the canonical request.
pub fn fingerprint(request: &Value) -> String {
    hex::encode(blake3::hash(canonical_json(request).as_bytes()).as_bytes())
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<Store>,
    metrics: Arc<EconomyMetrics>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<Store>, metrics: Arc<EconomyMetrics>) -> Self {
        Self { store, metrics }
    }

    pub fn begin(
        &self,
        actor: &str,
        scope: &str,
        key: &str,
        request: &Value,
    ) -> Result<BeginOutcome, EconomyError> {
        let request_hash = fingerprint(request);
        let now_ms = self.store.now_ms();
        let (record, inserted) = self.store.write(|tx| {
            let inserted = tx.execute(
                "INSERT INTO idempotency_records
                 (actor, scope, key, request_hash, status, response, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                 ON CONFLICT(actor, scope, key) DO NOTHING",
                params![
                    actor,
                    scope,
                    key,
                    request_hash,
                    IdempotencyStatus::InProgress.as_str(),
                    now_ms
                ],
            )? == 1;
            let record = load_record(tx, actor, scope, key)?.ok_or_else(|| {
                EconomyError::InvalidState {
                    status: "MISSING".to_string(),
                }
            })?;
            Ok((record, inserted))
        })?;

        if inserted {
            debug!(actor, scope, key, "idempotency key claimed");
            return Ok(BeginOutcome::Proceed(record));
        }
        if record.request_hash != request_hash {
            self.metrics.inc_idempotent_conflicts();
            warn!(actor, scope, key, "idempotency key reused with a different request");
            return Err(EconomyError::KeyReuseMismatch {
                actor: actor.to_string(),
                scope: scope.to_string(),
                key: key.to_string(),
            });
        }
        match record.status {
            IdempotencyStatus::Completed => {
                self.metrics.inc_idempotent_replays();
                debug!(actor, scope, key, "replaying cached response");
                let response = record.response.clone().unwrap_or(Value::Null);
                Ok(BeginOutcome::Replay { record, response })
            }
            IdempotencyStatus::InProgress => Ok(BeginOutcome::InFlight(record)),
            IdempotencyStatus::Failed => Err(EconomyError::InvalidState {
                status: record.status.to_string(),
            }),
        }
    }

    /// Freeze `response` and mark the record `COMPLETED`.
    ///
    /// Completing twice with the same response is accepted; anything else on a
    /// record that is no longer in progress is [`EconomyError::InvalidState`].
    pub fn complete(
        &self,
        record: &IdempotencyRecord,
        response: &Value,
    ) -> Result<IdempotencyRecord, EconomyError> {
        let now_ms = self.store.now_ms();
        let encoded = serde_json::to_string(response)?;
        self.store.write(|tx| {
            tx.execute(
                "UPDATE idempotency_records
                 SET status = ?1, response = ?2, updated_at_ms = ?3
                 WHERE actor = ?4 AND scope = ?5 AND key = ?6
                   AND request_hash = ?7 AND status = ?8",
                params![
                    IdempotencyStatus::Completed.as_str(),
                    encoded,
                    now_ms,
                    record.actor,
                    record.scope,
                    record.key,
                    record.request_hash,
                    IdempotencyStatus::InProgress.as_str()
                ],
            )?;
            let current = load_record(tx, &record.actor, &record.scope, &record.key)?
                .ok_or_else(|| EconomyError::InvalidState {
                    status: "MISSING".to_string(),
                })?;
            let frozen = current.status == IdempotencyStatus::Completed
                && current.request_hash == record.request_hash
                && current.response.as_ref() == Some(response);
            if !frozen {
                return Err(EconomyError::InvalidState {
                    status: current.status.to_string(),
                });
            }
            Ok(current)
        })
    }

    /// Abandon an in-progress record; later `begin` calls with this key fail
    /// with [`EconomyError::InvalidState`].
    pub fn fail(&self, record: &IdempotencyRecord) -> Result<(), EconomyError> {
        let now_ms = self.store.now_ms();
        self.store.write(|tx| {
            tx.execute(
                "UPDATE idempotency_records SET status = ?1, updated_at_ms = ?2
                 WHERE actor = ?3 AND scope = ?4 AND key = ?5 AND status = ?6",
                params![
                    IdempotencyStatus::Failed.as_str(),
                    now_ms,
                    record.actor,
                    record.scope,
                    record.key,
                    IdempotencyStatus::InProgress.as_str()
                ],
            )?;
            Ok(())
        })
    }

    /// Drop an in-progress record so the same key may be retried.
    fn release(&self, record: &IdempotencyRecord) -> Result<(), EconomyError> {
        self.store.write(|tx| {
            tx.execute(
                "DELETE FROM idempotency_records
                 WHERE actor = ?1 AND scope = ?2 AND key = ?3 AND status = ?4",
                params![
                    record.actor,
                    record.scope,
                    record.key,
                    IdempotencyStatus::InProgress.as_str()
                ],
            )?;
            Ok(())
        })
    }

    pub fn record(
        &self,
        actor: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, EconomyError> {
        self.store.read(|conn| load_record(conn, actor, scope, key))
    }

    /// Run `f` at most once per `(actor, scope, key, request)`.
    ///
    /// A retryable failure of `f` releases the key, so `f` may run again with
    /// the same key: every write it commits before a later step fails must be
    /// keyed so a re-run skips it. A permanent failure marks the key failed, as
    /// does a response that cannot be stored. Duplicates arriving while `f`
    /// runs get [`EconomyError::DuplicateInFlight`].
    pub fn execute(
        &self,
        actor: &str,
        scope: &str,
        key: &str,
        request: &Value,
        f: impl FnOnce() -> Result<Value, EconomyError>,
    ) -> Result<Execution, EconomyError> {
        let record = match self.begin(actor, scope, key, request)? {
            BeginOutcome::Proceed(record) => record,
            BeginOutcome::Replay { response, .. } => return Ok(Execution::Replayed(response)),
            BeginOutcome::InFlight(_) => return Err(EconomyError::DuplicateInFlight),
        };
        match f() {
            Ok(response) => match self.complete(&record, &response) {
                Ok(_) => Ok(Execution::Executed(response)),
                Err(err) => {
                    warn!(actor, scope, key, error = %err, "side effect applied but response not stored");
                    if let Err(fail_err) = self.fail(&record) {
                        warn!(actor, scope, key, error = %fail_err, "failed to abandon idempotency record");
                    }
                    Err(err)
                }
            },
            Err(err) => {
                let cleanup = match err.code().disposition() {
                    Disposition::Retry => self.release(&record),
                    Disposition::Permanent | Disposition::AlreadyDone => self.fail(&record),
                };
                if let Err(cleanup_err) = cleanup {
                    warn!(actor, scope, key, error = %cleanup_err, "failed to settle idempotency record");
                }
                Err(err)
            }
        }
    }
}

fn load_record(
    conn: &rusqlite::Connection,
    actor: &str,
    scope: &str,
    key: &str,
) -> Result<Option<IdempotencyRecord>, EconomyError> {
    let row = conn
        .query_row(
            "SELECT request_hash, status, response, created_at_ms, updated_at_ms
             FROM idempotency_records WHERE actor = ?1 AND scope = ?2 AND key = ?3",
            params![actor, scope, key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, u64>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((request_hash, status, response, created_at_ms, updated_at_ms)) = row else {
        return Ok(None);
    };
    let status = match status.parse::<IdempotencyStatus>() {
        Ok(status) => status,
        Err(_) => return Err(EconomyError::InvalidState { status }),
    };
    let response = response
        .map(|encoded| serde_json::from_str(&encoded))
        .transpose()?;
    Ok(Some(IdempotencyRecord {
        actor: actor.to_string(),
        scope: scope.to_string(),
        key: key.to_string(),
        request_hash,
        status,
        response,
        created_at_ms,
        updated_at_ms,
    }))
}
