//! Cooperative memory budget for decoded pixel buffers.
//!
//! Decoding a large source at full resolution can take hundreds of megabytes.
//! Before the encoder decodes anything it reserves the estimated peak cost
//! (see [`estimate_decode_bytes`](crate::sizing::estimate_decode_bytes)) under
//! a `(asset_id, tag, run)` key, where `run` comes from
//! [`MemoryBudget::begin_run`] once per profile, so two profiles of the same
//! asset in flight at once never share a key. The budget is advisory: it does
//! not allocate, it only makes concurrent decodes queue (or fail fast) instead
//! of piling up.
//!
//! ## Reservations
//!
//! [`MemoryBudget::acquire`] returns a [`Reservation`] guard. Dropping the
//! guard releases the key, so the release happens on success, on error, and
//! when the owning future is dropped mid-flight (cancellation).
//!
//! The check and the insert happen under one lock, before the caller reaches
//! its decode suspension point, so two decodes can never both slip past a
//! budget that only fits one of them.
//!
//! A key is single-use: a key that is already held is treated exactly like a
//! request that does not fit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::error::PipelineError;
use crate::types::AssetId;

/// Scope of one reservation: one variant attempt of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub asset_id: AssetId,
    pub tag: String,
    /// Profile run that owns the reservation; `0` outside any run.
    pub run: u64,
}

impl ReservationKey {
    pub fn new(asset_id: AssetId, tag: impl Into<String>) -> Self {
        Self {
            asset_id,
            tag: tag.into(),
            run: 0,
        }
    }

    pub fn with_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_id, self.tag)?;
        if self.run != 0 {
            write!(f, "#{}", self.run)?;
        }
        Ok(())
    }
}

/// External accounting collaborator (e.g. a UI bitmap cache that wants to
/// shrink while large decodes are in flight). Mirrors every reserve/release.
pub trait MemorySink: Send + Sync {
    fn reserve(&self, key: &ReservationKey, bytes: u64);
    fn release(&self, key: &ReservationKey);
}

/// What [`MemoryBudget::acquire`] does when a request does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    /// Queue until enough of the budget is released.
    #[default]
    Wait,
    /// Return [`PipelineError::MemoryPressure`] immediately.
    Fail,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<ReservationKey, u64>,
    total: u64,
}

/// Shared byte budget for decodes, keyed by `(asset_id, tag)`.
pub struct MemoryBudget {
    limit: u64,
    policy: MemoryPolicy,
    ledger: Mutex<Ledger>,
    released: Notify,
    sink: Option<Arc<dyn MemorySink>>,
    runs: AtomicU64,
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("limit", &self.limit)
            .field("policy", &self.policy)
            .field("reserved", &self.total_reserved())
            .finish()
    }
}

impl MemoryBudget {
    pub fn new(limit: u64, policy: MemoryPolicy) -> Self {
        Self {
            limit,
            policy,
            ledger: Mutex::new(Ledger::default()),
            released: Notify::new(),
            sink: None,
            runs: AtomicU64::new(0),
        }
    }

    /// Mirror every reserve/release into `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MemorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// Fresh non-zero run id for one profile's reservations.
    pub fn begin_run(&self) -> u64 {
        self.runs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bytes currently held under `key`, if it is reserved.
    pub fn reserved(&self, key: &ReservationKey) -> Option<u64> {
        self.lock().entries.get(key).copied()
    }

    pub fn total_reserved(&self) -> u64 {
        self.lock().total
    }

    pub fn active_reservations(&self) -> usize {
        self.lock().entries.len()
    }

    /// Reserve `bytes` under `key`, following the budget's [`MemoryPolicy`].
    pub async fn acquire(
        &self,
        key: ReservationKey,
        bytes: u64,
    ) -> Result<Reservation<'_>, PipelineError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release between the
            // check and the await is not lost.
            notified.as_mut().enable();

            match self.try_acquire(key.clone(), bytes) {
                Ok(reservation) => return Ok(reservation),
                Err(err) if self.policy == MemoryPolicy::Wait => {
                    log::debug!("waiting for memory budget: {err}");
                    notified.await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reserve without waiting.
    ///
    /// A request larger than the whole budget is admitted when nothing else is
    /// reserved; otherwise it could never be served.
    pub fn try_acquire(
        &self,
        key: ReservationKey,
        bytes: u64,
    ) -> Result<Reservation<'_>, PipelineError> {
        let mut ledger = self.lock();
        let available = self.limit.saturating_sub(ledger.total);
        let fits = bytes <= available || ledger.entries.is_empty();

        if ledger.entries.contains_key(&key) || !fits {
            return Err(PipelineError::MemoryPressure {
                key,
                requested: bytes,
                available,
            });
        }

        ledger.entries.insert(key.clone(), bytes);
        ledger.total += bytes;
        drop(ledger);

        if let Some(sink) = &self.sink {
            sink.reserve(&key, bytes);
        }
        log::debug!("reserved {bytes} bytes for {key}");

        Ok(Reservation {
            budget: self,
            key,
            bytes,
        })
    }

    fn release(&self, key: &ReservationKey) {
        let released = {
            let mut ledger = self.lock();
            let bytes = ledger.entries.remove(key);
            if let Some(bytes) = bytes {
                ledger.total -= bytes;
            }
            bytes
        };

        if let Some(bytes) = released {
            if let Some(sink) = &self.sink {
                sink.release(key);
            }
            log::debug!("released {bytes} bytes for {key}");
            self.released.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held budget; released when dropped.
#[derive(Debug)]
#[must_use = "the reservation is released as soon as it is dropped"]
pub struct Reservation<'a> {
    budget: &'a MemoryBudget,
    key: ReservationKey,
    bytes: u64,
}

impl Reservation<'_> {
    pub fn key(&self) -> &ReservationKey {
        &self.key
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.release(&self.key);
    }
}
