//! In-flight generation deduplication with failure blackouts.
//!
//! A signature owns at most one pending generation at a time. Callers that
//! arrive while it is in flight receive a clone of the same shared handle.
//! When the generation fails, the signature enters a blackout and further
//! requests fail fast until it expires. A periodic sweep, armed lazily on the
//! first registration, evicts pending entries that never settled and expired
//! blackouts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use relay_core::{elapsed_ms, lock_or_recover, TimeContext, TimerHandle};
use tracing::{debug, info, warn};

use crate::dedup_types::{
    CleanupReport, DedupConfig, DedupError, DedupTicket, GeneratedResponse, GenerationError,
    GenerationHandle, RequestContext,
};
use crate::request_signature::request_signature;

struct PendingRequest {
    entry_id: u64,
    handle: GenerationHandle,
    registered_at_ms: u64,
}

#[derive(Default)]
struct DedupState {
    pending: HashMap<String, PendingRequest>,
    blackouts: HashMap<String, u64>,
    next_entry_id: u64,
}

impl DedupState {
    /// Returns the remaining blackout for `signature`, dropping it when expired.
    fn active_blackout(&mut self, signature: &str, now_ms: u64) -> Option<u64> {
        let expires_at_ms = *self.blackouts.get(signature)?;
        if now_ms < expires_at_ms {
            return Some(expires_at_ms - now_ms);
        }
        self.blackouts.remove(signature);
        None
    }

    fn sweep(&mut self, now_ms: u64, request_ttl_ms: u64) -> CleanupReport {
        let pending_before = self.pending.len();
        self.pending
            .retain(|_, entry| elapsed_ms(entry.registered_at_ms, now_ms) < request_ttl_ms);
        let blackouts_before = self.blackouts.len();
        self.blackouts
            .retain(|_, expires_at_ms| now_ms < *expires_at_ms);
        CleanupReport {
            expired_pending: pending_before - self.pending.len(),
            expired_blackouts: blackouts_before - self.blackouts.len(),
        }
    }
}

/// Deduplicates expensive generation calls per request signature.
pub struct RequestDeduplicator {
    config: DedupConfig,
    time: TimeContext,
    state: Arc<Mutex<DedupState>>,
    sweep_timer: Mutex<Option<TimerHandle>>,
}

impl RequestDeduplicator {
    pub fn new(config: DedupConfig, time: TimeContext) -> Self {
        Self {
            config,
            time,
            state: Arc::new(Mutex::new(DedupState::default())),
            sweep_timer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    /// Returns the in-flight handle for the request, `None` when the caller
    /// must register, or a blackout error when the signature recently failed.
    ///
    /// Check and register are separate calls here: the caller must not await
    /// between a `None` result and [`Self::register_pending`]. Prefer
    /// [`Self::check_or_register`], which performs both under one lock.
    pub fn check_duplicate(
        &self,
        personality_name: &str,
        content: &str,
        context: Option<&RequestContext>,
    ) -> Result<Option<GenerationHandle>, DedupError> {
        let signature = request_signature(personality_name, content, context);
        let now_ms = self.time.now_ms();
        let mut state = lock_or_recover(&self.state);
        if let Some(retry_after_ms) = state.active_blackout(&signature, now_ms) {
            debug!(signature = %signature, retry_after_ms, "dedup check hit error blackout");
            return Err(DedupError::Blackout {
                signature,
                retry_after_ms,
            });
        }
        Ok(state
            .pending
            .get(&signature)
            .map(|entry| entry.handle.clone()))
    }

    /// Registers `generation` as the in-flight call for the request and
    /// returns its signature together with the shared handle.
    ///
    /// The handle settles the entry when it completes: success removes it,
    /// failure removes it and starts an error blackout. An existing entry for
    /// the same signature is replaced.
    pub fn register_pending<F>(
        &self,
        personality_name: &str,
        content: &str,
        context: Option<&RequestContext>,
        generation: F,
    ) -> (String, GenerationHandle)
    where
        F: Future<Output = Result<GeneratedResponse, GenerationError>> + Send + 'static,
    {
        let signature = request_signature(personality_name, content, context);
        let handle = {
            let mut state = lock_or_recover(&self.state);
            self.insert_pending_locked(&mut state, &signature, generation)
        };
        self.ensure_sweep_scheduled();
        (signature, handle)
    }

    /// Atomic check-then-register.
    ///
    /// `make_generation` is only invoked when no generation is in flight for the
    /// signature; it must build the future without polling it. Concurrent
    /// callers for one signature all receive the same handle.
    pub fn check_or_register<F, Fut>(
        &self,
        personality_name: &str,
        content: &str,
        context: Option<&RequestContext>,
        make_generation: F,
    ) -> Result<DedupTicket, DedupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GeneratedResponse, GenerationError>> + Send + 'static,
    {
        let signature = request_signature(personality_name, content, context);
        let now_ms = self.time.now_ms();
        let ticket = {
            let mut state = lock_or_recover(&self.state);
            if let Some(retry_after_ms) = state.active_blackout(&signature, now_ms) {
                debug!(signature = %signature, retry_after_ms, "dedup check hit error blackout");
                return Err(DedupError::Blackout {
                    signature,
                    retry_after_ms,
                });
            }
            if let Some(entry) = state.pending.get(&signature) {
                debug!(signature = %signature, "joining in-flight generation");
                DedupTicket::Existing {
                    signature,
                    handle: entry.handle.clone(),
                }
            } else {
                let handle =
                    self.insert_pending_locked(&mut state, &signature, make_generation());
                DedupTicket::Registered { signature, handle }
            }
        };
        if !ticket.is_existing() {
            self.ensure_sweep_scheduled();
        }
        Ok(ticket)
    }

    /// Starts a blackout for the request without a registered handle.
    pub fn mark_failed(
        &self,
        personality_name: &str,
        content: &str,
        context: Option<&RequestContext>,
    ) -> String {
        let signature = request_signature(personality_name, content, context);
        let expires_at_ms = self
            .time
            .now_ms()
            .saturating_add(self.config.error_blackout_ms);
        let mut state = lock_or_recover(&self.state);
        state.pending.remove(&signature);
        state.blackouts.insert(signature.clone(), expires_at_ms);
        info!(signature = %signature, expires_at_ms, "request marked failed");
        signature
    }

    pub fn is_blacked_out(
        &self,
        personality_name: &str,
        content: &str,
        context: Option<&RequestContext>,
    ) -> bool {
        let signature = request_signature(personality_name, content, context);
        let now_ms = self.time.now_ms();
        lock_or_recover(&self.state)
            .active_blackout(&signature, now_ms)
            .is_some()
    }

    /// Evicts pending requests older than the request TTL and expired
    /// blackouts. Runs on every sweep tick and may be called directly.
    pub fn cleanup_stale_entries(&self) -> CleanupReport {
        run_sweep(&self.state, &self.time, self.config.request_ttl_ms)
    }

    pub fn pending_count(&self) -> usize {
        lock_or_recover(&self.state).pending.len()
    }

    pub fn blackout_count(&self) -> usize {
        lock_or_recover(&self.state).blackouts.len()
    }

    pub fn is_sweep_scheduled(&self) -> bool {
        lock_or_recover(&self.sweep_timer).is_some()
    }

    /// Drops every pending request and blackout.
    pub fn clear(&self) {
        let mut state = lock_or_recover(&self.state);
        state.pending.clear();
        state.blackouts.clear();
    }

    /// Cancels the sweep timer and clears all state.
    pub fn shutdown(&self) {
        if let Some(timer) = lock_or_recover(&self.sweep_timer).take() {
            timer.cancel();
        }
        self.clear();
    }

    fn insert_pending_locked<F>(
        &self,
        state: &mut DedupState,
        signature: &str,
        generation: F,
    ) -> GenerationHandle
    where
        F: Future<Output = Result<GeneratedResponse, GenerationError>> + Send + 'static,
    {
        let entry_id = state.next_entry_id;
        state.next_entry_id = state.next_entry_id.saturating_add(1);
        let handle = settle_on_completion(
            Arc::downgrade(&self.state),
            self.time.clone(),
            self.config.error_blackout_ms,
            signature.to_string(),
            entry_id,
            generation,
        );
        let registered_at_ms = self.time.now_ms();
        if state
            .pending
            .insert(
                signature.to_string(),
                PendingRequest {
                    entry_id,
                    handle: handle.clone(),
                    registered_at_ms,
                },
            )
            .is_some()
        {
            warn!(signature = %signature, "replaced an in-flight generation for the same signature");
        }
        debug!(signature = %signature, registered_at_ms, "registered pending generation");
        handle
    }

    fn ensure_sweep_scheduled(&self) {
        let mut sweep_timer = lock_or_recover(&self.sweep_timer);
        if sweep_timer.is_some() {
            return;
        }
        let state = Arc::downgrade(&self.state);
        let time = self.time.clone();
        let request_ttl_ms = self.config.request_ttl_ms;
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        *sweep_timer = Some(self.time.timers.schedule_repeating(
            period,
            Arc::new(move || {
                if let Some(state) = state.upgrade() {
                    run_sweep(&state, &time, request_ttl_ms);
                }
            }),
        ));
    }
}

fn run_sweep(state: &Mutex<DedupState>, time: &TimeContext, request_ttl_ms: u64) -> CleanupReport {
    let now_ms = time.now_ms();
    let report = lock_or_recover(state).sweep(now_ms, request_ttl_ms);
    if report.expired_pending > 0 {
        warn!(
            expired_pending = report.expired_pending,
            request_ttl_ms, "evicted pending generations that never settled"
        );
    }
    if !report.is_empty() {
        debug!(
            expired_pending = report.expired_pending,
            expired_blackouts = report.expired_blackouts,
            "dedup sweep completed"
        );
    }
    report
}

fn settle_on_completion<F>(
    state: Weak<Mutex<DedupState>>,
    time: TimeContext,
    error_blackout_ms: u64,
    signature: String,
    entry_id: u64,
    generation: F,
) -> GenerationHandle
where
    F: Future<Output = Result<GeneratedResponse, GenerationError>> + Send + 'static,
{
    async move {
        let outcome = generation.await;
        if let Some(state) = state.upgrade() {
            let mut state = lock_or_recover(&state);
            // A newer registration owns the signature once this entry was
            // evicted and replaced; it must stay joinable.
            let superseded = match state.pending.get(&signature) {
                Some(entry) if entry.entry_id == entry_id => {
                    state.pending.remove(&signature);
                    false
                }
                Some(_) => true,
                None => false,
            };
            if superseded {
                debug!(signature = %signature, "stale generation settled after a newer registration");
            } else if let Err(error) = &outcome {
                let expires_at_ms = time.now_ms().saturating_add(error_blackout_ms);
                state.blackouts.insert(signature.clone(), expires_at_ms);
                warn!(
                    signature = %signature,
                    expires_at_ms,
                    error = %error,
                    "generation failed; signature entering error blackout"
                );
            }
        }
        outcome
    }
    .boxed()
    .shared()
}
