//! In-memory ledger with the same compare-and-set semantics as [`super::Database`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::api::Ticket;
use crate::models::{Fingerprint, LegRecord, LegState, Signal, SignalStatus};

use super::{LedgerEntry, LedgerError, SignalLedger};

struct StoredSignal {
    signal: Signal,
    entry: LedgerEntry,
}

#[derive(Default)]
struct MemoryState {
    signals: HashMap<Fingerprint, StoredSignal>,
    legs: BTreeMap<(Fingerprint, u32), LegRecord>,
}

/// Ledger kept in process memory; used for paper runs and tests.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalLedger for MemoryLedger {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<SignalStatus>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.signals.get(fingerprint).map(|s| s.entry.status))
    }

    async fn insert_pending(&self, signal: &Signal) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        if state.signals.contains_key(signal.fingerprint()) {
            return Ok(false);
        }
        let now = Utc::now();
        state.signals.insert(
            signal.fingerprint().clone(),
            StoredSignal {
                signal: signal.clone(),
                entry: LedgerEntry {
                    fingerprint: signal.fingerprint().clone(),
                    symbol: signal.symbol().to_string(),
                    direction: signal.direction(),
                    status: SignalStatus::Pending,
                    created_at: now,
                    updated_at: now,
                },
            },
        );
        Ok(true)
    }

    async fn try_set(
        &self,
        fingerprint: &Fingerprint,
        from: SignalStatus,
        to: SignalStatus,
    ) -> Result<bool, LedgerError> {
        if !from.can_advance_to(to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }
        let mut state = self.state.lock().await;
        match state.signals.get_mut(fingerprint) {
            Some(stored) if stored.entry.status == from => {
                stored.entry.status = to;
                stored.entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn signal(&self, fingerprint: &Fingerprint) -> Result<Option<Signal>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.signals.get(fingerprint).map(|s| s.signal.clone()))
    }

    async fn entries(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> =
            state.signals.values().map(|s| s.entry.clone()).collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn record_leg(&self, leg: &LegRecord) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if !state.signals.contains_key(&leg.fingerprint) {
            return Err(LedgerError::UnknownSignal(leg.fingerprint.clone()));
        }
        state
            .legs
            .insert((leg.fingerprint.clone(), leg.leg), leg.clone());
        Ok(())
    }

    async fn legs(&self, fingerprint: &Fingerprint) -> Result<Vec<LegRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .legs
            .values()
            .filter(|l| &l.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn leg_by_ticket(&self, ticket: Ticket) -> Result<Option<LegRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .legs
            .values()
            .find(|l| l.ticket == Some(ticket))
            .cloned())
    }

    async fn legs_in_state(&self, leg_state: LegState) -> Result<Vec<LegRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .legs
            .values()
            .filter(|l| l.state == leg_state)
            .cloned()
            .collect())
    }

    async fn try_set_leg_state(
        &self,
        fingerprint: &Fingerprint,
        leg: u32,
        from: LegState,
        to: LegState,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        match state.legs.get_mut(&(fingerprint.clone(), leg)) {
            Some(record) if record.state == from => {
                record.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
