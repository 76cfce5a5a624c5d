//! Position Reconciliation Layer
//!
//! Normalizes the gateway's heterogeneous position payloads into the
//! canonical model, keeps one working set per account, and shields the
//! rest of the application from upstream noise:
//!
//! - high-frequency price/PnL ticks are coalesced per position and per
//!   update class, bursts collapsing to the latest value;
//! - closed positions are retained with a closed flag for a short grace
//!   window so exit transitions can render, then purged;
//! - aggregate unrealized PnL is recomputed on every active-set change;
//! - a staleness watchdog requests a fresh snapshot when a `READY`
//!   connection goes quiet, with bounded backoff-scheduled retries.
//!
//! Every handler contains its own failures: one malformed payload is
//! logged and flips the degraded flag, it never halts the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::position::{NormalizeError, Position, RawPositionPayload};
use crate::domain::subscription::ConnectionKey;
use crate::infrastructure::broadcast::{PositionChange, PositionEvent, SharedEventHub};
use crate::infrastructure::config::ReconcilerSettings;
use crate::infrastructure::gateway::GatewayMessage;
use crate::infrastructure::manager::cache::DataCache;

/// Granularity of the flush/health sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Internal State
// =============================================================================

/// Throttle class of a coalesced update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ThrottleClass {
    Price,
    Pnl,
}

/// A coalesced update awaiting its flush deadline.
#[derive(Debug)]
struct PendingUpdate {
    payload: RawPositionPayload,
    due: Instant,
}

/// A closed position inside its grace window.
#[derive(Debug)]
struct ClosedPosition {
    position: Position,
    closed_at: Instant,
}

/// Snapshot payload coalesced under the bulk throttle.
#[derive(Debug)]
struct PendingSnapshot {
    payloads: Vec<RawPositionPayload>,
    due: Instant,
}

/// Per-account reconciliation state.
struct AccountBook {
    active: HashMap<String, Position>,
    closed: HashMap<String, ClosedPosition>,
    pending: HashMap<(String, ThrottleClass), PendingUpdate>,
    pending_snapshot: Option<PendingSnapshot>,
    last_emit: HashMap<(String, ThrottleClass), Instant>,
    last_snapshot_applied: Option<Instant>,
    last_success: Instant,
    connection_ready: bool,
    awaiting_snapshot: bool,
    refresh_attempts: u32,
    next_refresh_at: Option<Instant>,
    healthy: bool,
    degraded: bool,
}

impl AccountBook {
    fn new(now: Instant) -> Self {
        Self {
            active: HashMap::new(),
            closed: HashMap::new(),
            pending: HashMap::new(),
            pending_snapshot: None,
            last_emit: HashMap::new(),
            last_snapshot_applied: None,
            last_success: now,
            connection_ready: false,
            awaiting_snapshot: false,
            refresh_attempts: 0,
            next_refresh_at: None,
            healthy: true,
            degraded: false,
        }
    }

    fn touch_success(&mut self, now: Instant) {
        self.last_success = now;
    }

    fn total_unrealized_pnl(&self) -> Decimal {
        self.active
            .values()
            .filter_map(|p| p.unrealized_pnl)
            .sum()
    }
}

/// Externally visible health of one account's reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerStatus {
    /// Fresh data is flowing (or nothing indicates otherwise).
    pub healthy: bool,
    /// At least one malformed payload was dropped since the last snapshot.
    pub degraded: bool,
    /// Snapshot refresh attempts consumed in the current outage.
    pub refresh_attempts: u32,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Position reconciliation service.
///
/// One instance serves every account; state is partitioned internally by
/// [`ConnectionKey`]. Ingest is synchronous; coalesced flushes, grace
/// purges, and the health watchdog run on a background sweep started by
/// [`PositionReconciler::run`].
pub struct PositionReconciler {
    settings: ReconcilerSettings,
    cache: Arc<DataCache>,
    hub: SharedEventHub,
    refresh_tx: mpsc::Sender<ConnectionKey>,
    books: Mutex<HashMap<ConnectionKey, AccountBook>>,
    cancel: CancellationToken,
}

impl PositionReconciler {
    /// Create a reconciler.
    ///
    /// `refresh_tx` carries snapshot-refresh requests back to whatever
    /// owns the connections (the manager sends `get_positions` upstream).
    #[must_use]
    pub fn new(
        settings: ReconcilerSettings,
        cache: Arc<DataCache>,
        hub: SharedEventHub,
        refresh_tx: mpsc::Sender<ConnectionKey>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            cache,
            hub,
            refresh_tx,
            books: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Run the background sweep until cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("reconciler sweep cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }

    /// Track whether the account's connection currently reports `READY`.
    ///
    /// The staleness watchdog only runs while the transport claims to be
    /// healthy; a socket-level outage is the connection's problem.
    pub fn set_connection_ready(&self, key: &ConnectionKey, ready: bool) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);
        book.connection_ready = ready;
        if !ready {
            book.refresh_attempts = 0;
            book.next_refresh_at = None;
        }
    }

    /// Feed one gateway data message through the reconciliation handlers.
    pub fn ingest(&self, key: &ConnectionKey, message: &GatewayMessage) {
        let now = Instant::now();
        match message {
            GatewayMessage::UserData { data } => {
                self.on_snapshot(key, &data.positions, now);
            }
            GatewayMessage::PositionsSnapshot { data } => {
                self.on_snapshot_throttled(key, data, now);
            }
            GatewayMessage::PositionOpened { data } => {
                self.on_opened(key, data, now);
            }
            GatewayMessage::PositionClosed { data } => {
                self.on_closed(key, data, now);
            }
            GatewayMessage::PositionUpdated { data } => {
                self.on_modified(key, data, now);
            }
            GatewayMessage::PositionPriceUpdate { data } => {
                self.on_throttled(key, data, ThrottleClass::Price, now);
            }
            GatewayMessage::PositionPnlUpdate { data } => {
                self.on_throttled(key, data, ThrottleClass::Pnl, now);
            }
            _ => {}
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Active positions for one account.
    #[must_use]
    pub fn positions(&self, key: &ConnectionKey) -> Vec<Position> {
        self.books
            .lock()
            .get(key)
            .map(|book| book.active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Closed positions still inside their grace window.
    #[must_use]
    pub fn closing_positions(&self, key: &ConnectionKey) -> Vec<Position> {
        self.books
            .lock()
            .get(key)
            .map(|book| book.closed.values().map(|c| c.position.clone()).collect())
            .unwrap_or_default()
    }

    /// Aggregate unrealized PnL over the active set.
    #[must_use]
    pub fn total_unrealized_pnl(&self, key: &ConnectionKey) -> Decimal {
        self.books
            .lock()
            .get(key)
            .map(AccountBook::total_unrealized_pnl)
            .unwrap_or_default()
    }

    /// Health of one account's reconciliation.
    #[must_use]
    pub fn status(&self, key: &ConnectionKey) -> ReconcilerStatus {
        self.books.lock().get(key).map_or(
            ReconcilerStatus {
                healthy: true,
                degraded: false,
                refresh_attempts: 0,
            },
            |book| ReconcilerStatus {
                healthy: book.healthy,
                degraded: book.degraded,
                refresh_attempts: book.refresh_attempts,
            },
        )
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    fn on_opened(&self, key: &ConnectionKey, raw: &RawPositionPayload, now: Instant) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);

        let position = match raw.normalize(&key.broker_id, &key.account_id, Utc::now()) {
            Ok(position) => position,
            Err(e) => return Self::degrade(book, key, &e),
        };

        book.closed.remove(&position.position_id);
        book.active
            .insert(position.position_id.clone(), position.clone());
        book.touch_success(now);

        self.cache.upsert_position(position.clone());
        self.emit(key, book, PositionChange::Opened, position);
    }

    fn on_closed(&self, key: &ConnectionKey, raw: &RawPositionPayload, now: Instant) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);

        let Some(id) = raw.identity() else {
            return Self::degrade(book, key, &NormalizeError::MissingIdentity);
        };

        book.touch_success(now);
        self.close_position(key, book, &id, raw, now);
    }

    fn on_modified(&self, key: &ConnectionKey, raw: &RawPositionPayload, now: Instant) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);

        let Some(id) = raw.identity() else {
            return Self::degrade(book, key, &NormalizeError::MissingIdentity);
        };
        book.touch_success(now);

        // A modification down to zero quantity is a close.
        if raw.net_pos.is_some() && raw.is_flat() {
            self.close_position(key, book, &id, raw, now);
            return;
        }

        if let Some(existing) = book.active.get_mut(&id) {
            merge_into(existing, raw);
            let position = existing.clone();
            self.cache.upsert_position(position.clone());
            self.emit(key, book, PositionChange::Updated, position);
        } else {
            // First sight of this position; treat as an open.
            drop(books);
            self.on_opened(key, raw, now);
        }
    }

    fn on_throttled(
        &self,
        key: &ConnectionKey,
        raw: &RawPositionPayload,
        class: ThrottleClass,
        now: Instant,
    ) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);

        let Some(id) = raw.identity() else {
            return Self::degrade(book, key, &NormalizeError::MissingIdentity);
        };
        if !book.active.contains_key(&id) {
            // Tick for a position we no longer track; drop it.
            return;
        }
        book.touch_success(now);

        let delay = self.class_delay(class);
        let throttle_key = (id.clone(), class);
        let quiet = book
            .last_emit
            .get(&throttle_key)
            .is_none_or(|last| now.duration_since(*last) >= delay);

        if quiet && !book.pending.contains_key(&throttle_key) {
            // Leading edge: apply immediately.
            if let Some(existing) = book.active.get_mut(&id) {
                merge_into(existing, raw);
                let position = existing.clone();
                book.last_emit.insert(throttle_key, now);
                self.cache.upsert_position(position.clone());
                self.emit(key, book, PositionChange::Updated, position);
            }
        } else {
            // Inside the window: coalesce to the latest value.
            let due = book
                .last_emit
                .get(&throttle_key)
                .map_or(now + delay, |last| *last + delay);
            book.pending.insert(
                throttle_key,
                PendingUpdate {
                    payload: raw.clone(),
                    due,
                },
            );
        }
    }

    /// Snapshot entry point with bulk coalescing: the first snapshot in a
    /// quiet period applies immediately, repeats within the bulk window
    /// collapse to the latest payload.
    fn on_snapshot_throttled(&self, key: &ConnectionKey, payloads: &[RawPositionPayload], now: Instant) {
        let quiet = {
            let mut books = self.books.lock();
            let book = Self::book_mut(&mut books, key);
            let quiet = book
                .last_snapshot_applied
                .is_none_or(|last| now.duration_since(last) >= self.settings.bulk_throttle);
            if !quiet {
                let due = book.last_snapshot_applied.map_or(
                    now + self.settings.bulk_throttle,
                    |last| last + self.settings.bulk_throttle,
                );
                book.pending_snapshot = Some(PendingSnapshot {
                    payloads: payloads.to_vec(),
                    due,
                });
            }
            quiet
        };

        if quiet {
            self.on_snapshot(key, payloads, now);
        }
    }

    /// Apply a snapshot: replace the account's working set. Entries
    /// missing a PnL retain the previously cached value; flat entries and
    /// omissions close immediately.
    fn on_snapshot(&self, key: &ConnectionKey, payloads: &[RawPositionPayload], now: Instant) {
        let mut books = self.books.lock();
        let book = Self::book_mut(&mut books, key);

        // A fresh snapshot clears prior degradation; its own malformed
        // entries may re-flag it below.
        book.degraded = false;

        let mut next: HashMap<String, Position> = HashMap::new();
        for raw in payloads {
            let Some(id) = raw.identity() else {
                Self::degrade(book, key, &NormalizeError::MissingIdentity);
                continue;
            };

            if raw.is_flat() {
                continue;
            }

            match raw.normalize(&key.broker_id, &key.account_id, Utc::now()) {
                Ok(mut position) => {
                    if let Some(previous) = book.active.get(&id) {
                        if position.unrealized_pnl.is_none() {
                            position.unrealized_pnl = previous.unrealized_pnl;
                        }
                        if position.current_price.is_none() {
                            position.current_price = previous.current_price;
                        }
                    }
                    next.insert(id, position);
                }
                Err(e) => Self::degrade(book, key, &e),
            }
        }

        // Anything absent from the fresh snapshot is closed.
        let removed: Vec<Position> = book
            .active
            .values()
            .filter(|p| !next.contains_key(&p.position_id))
            .cloned()
            .collect();

        book.active = next;
        book.pending.clear();
        book.pending_snapshot = None;
        book.last_snapshot_applied = Some(now);
        book.awaiting_snapshot = false;
        book.refresh_attempts = 0;
        book.next_refresh_at = None;
        book.healthy = true;
        book.touch_success(now);

        let survivors: Vec<Position> = book.active.values().cloned().collect();
        self.cache.replace_positions(key, &survivors);

        for position in removed {
            book.closed.insert(
                position.position_id.clone(),
                ClosedPosition {
                    position: position.clone(),
                    closed_at: now,
                },
            );
            self.emit(key, book, PositionChange::Closed, position);
        }
        for position in survivors {
            self.emit(key, book, PositionChange::Snapshot, position);
        }
    }

    // =========================================================================
    // Sweep (flush, grace purge, health)
    // =========================================================================

    /// One pass of the background sweep.
    fn sweep(&self, now: Instant) {
        let mut due_snapshots: Vec<(ConnectionKey, Vec<RawPositionPayload>)> = Vec::new();
        let mut refresh_requests: Vec<ConnectionKey> = Vec::new();

        {
            let mut books = self.books.lock();
            for (key, book) in books.iter_mut() {
                // Flush due coalesced updates.
                let due_keys: Vec<(String, ThrottleClass)> = book
                    .pending
                    .iter()
                    .filter(|(_, pending)| pending.due <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for throttle_key in due_keys {
                    if let Some(pending) = book.pending.remove(&throttle_key) {
                        let (id, _) = &throttle_key;
                        if let Some(existing) = book.active.get_mut(id) {
                            merge_into(existing, &pending.payload);
                            let position = existing.clone();
                            book.last_emit.insert(throttle_key, now);
                            self.cache.upsert_position(position.clone());
                            self.emit(key, book, PositionChange::Updated, position);
                        }
                    }
                }

                // Release a coalesced snapshot whose window elapsed.
                if book
                    .pending_snapshot
                    .as_ref()
                    .is_some_and(|pending| pending.due <= now)
                    && let Some(pending) = book.pending_snapshot.take()
                {
                    due_snapshots.push((key.clone(), pending.payloads));
                }

                // Purge closed positions past the grace window.
                let grace = self.settings.close_grace;
                book.closed
                    .retain(|_, closed| now.duration_since(closed.closed_at) < grace);

                // Staleness watchdog.
                if book.connection_ready
                    && now.duration_since(book.last_success) > self.settings.health_timeout
                {
                    if book.refresh_attempts >= self.settings.max_refresh_attempts {
                        if book.healthy {
                            book.healthy = false;
                            tracing::error!(
                                key = %key,
                                attempts = book.refresh_attempts,
                                "position data stale and refresh attempts exhausted"
                            );
                        }
                    } else if book
                        .next_refresh_at
                        .is_none_or(|next| now >= next)
                    {
                        book.refresh_attempts += 1;
                        book.healthy = false;
                        book.awaiting_snapshot = true;
                        let backoff = self.settings.refresh_timeout
                            * 2u32.saturating_pow(book.refresh_attempts - 1);
                        book.next_refresh_at = Some(now + backoff);
                        tracing::warn!(
                            key = %key,
                            attempt = book.refresh_attempts,
                            "position data stale, requesting snapshot refresh"
                        );
                        refresh_requests.push(key.clone());
                    }
                }
            }
        }

        for (key, payloads) in due_snapshots {
            self.on_snapshot(&key, &payloads, now);
        }
        for key in refresh_requests {
            if self.refresh_tx.try_send(key.clone()).is_err() {
                tracing::warn!(key = %key, "refresh channel full, dropping snapshot request");
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn close_position(
        &self,
        key: &ConnectionKey,
        book: &mut AccountBook,
        id: &str,
        raw: &RawPositionPayload,
        now: Instant,
    ) {
        let Some(mut position) = book.active.remove(id) else {
            return;
        };

        // Take whatever final numbers the close carried.
        if let Some(realized) = raw.realized_pnl {
            position.realized_pnl = Some(realized);
        }
        position.quantity = Decimal::ZERO;
        position.updated_at = Utc::now();

        book.pending.retain(|(pending_id, _), _| pending_id.as_str() != id);
        book.closed.insert(
            id.to_string(),
            ClosedPosition {
                position: position.clone(),
                closed_at: now,
            },
        );

        self.cache.remove_position(key, id);
        self.emit(key, book, PositionChange::Closed, position);
    }

    fn emit(
        &self,
        key: &ConnectionKey,
        book: &AccountBook,
        change: PositionChange,
        position: Position,
    ) {
        let _ = self.hub.send_position(PositionEvent {
            key: key.clone(),
            change,
            position,
            total_unrealized_pnl: book.total_unrealized_pnl(),
        });
    }

    fn degrade(book: &mut AccountBook, key: &ConnectionKey, error: &NormalizeError) {
        book.degraded = true;
        tracing::warn!(key = %key, error = %error, "malformed position payload dropped");
    }

    const fn class_delay(&self, class: ThrottleClass) -> Duration {
        match class {
            ThrottleClass::Price => self.settings.price_throttle,
            ThrottleClass::Pnl => self.settings.pnl_throttle,
        }
    }

    fn book_mut<'a>(
        books: &'a mut HashMap<ConnectionKey, AccountBook>,
        key: &ConnectionKey,
    ) -> &'a mut AccountBook {
        books
            .entry(key.clone())
            .or_insert_with(|| AccountBook::new(Instant::now()))
    }
}

/// Merge a partial raw payload over an existing position.
fn merge_into(existing: &mut Position, raw: &RawPositionPayload) {
    if let Some(net) = raw.net_pos {
        existing.quantity = net.abs();
        if let Some(side) = crate::domain::position::Side::from_net_quantity(net) {
            existing.side = side;
        }
    } else if let Some(qty) = raw.quantity {
        existing.quantity = qty.abs();
    }
    if let Some(side) = raw.side {
        existing.side = side;
    }
    if let Some(price) = raw.net_price.or(raw.avg_price) {
        existing.avg_price = price;
    }
    if raw.current_price.is_some() {
        existing.current_price = raw.current_price;
    }
    if raw.unrealized_pnl.is_some() {
        existing.unrealized_pnl = raw.unrealized_pnl;
    }
    if raw.realized_pnl.is_some() {
        existing.realized_pnl = raw.realized_pnl;
    }
    existing.updated_at = Utc::now();
}

// =============================================================================
// Tests
// =============================================================================
