//! Backend health roster.
//!
//! Cool-downs expire lazily: every selection first promotes backends whose
//! `cooldown_until` has passed back to `available`. There is no timer.
//! `exhausted` is permanent for the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BackendHealth, FailureReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendState {
    pub name: String,
    /// Position in the fallback order (0 = highest priority).
    pub rank: usize,
    pub health: BackendHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    backends: Vec<BackendState>,
}

impl Roster {
    /// Build a roster in priority order, everything `available`.
    pub fn new(order: &[String]) -> Self {
        let backends = order
            .iter()
            .enumerate()
            .map(|(rank, name)| BackendState {
                name: name.clone(),
                rank,
                health: BackendHealth::Available,
                cooldown_until: None,
                last_reason: None,
            })
            .collect();
        Self { backends }
    }

    pub fn states(&self) -> &[BackendState] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&BackendState> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Promote expired cool-downs to `available`. Returns the revived names.
    pub fn expire_cooldowns(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut revived = Vec::new();
        for backend in &mut self.backends {
            if backend.health == BackendHealth::CoolingDown
                && backend.cooldown_until.is_none_or(|until| until <= now)
            {
                backend.health = BackendHealth::Available;
                backend.cooldown_until = None;
                revived.push(backend.name.clone());
            }
        }
        revived
    }

    /// Highest-priority `available` backend not listed in `skip`.
    pub fn next_available(&mut self, now: DateTime<Utc>, skip: &[String]) -> Option<String> {
        self.expire_cooldowns(now);
        self.backends
            .iter()
            .find(|b| b.health == BackendHealth::Available && !skip.contains(&b.name))
            .map(|b| b.name.clone())
    }

    /// Cool a backend down until `until`. An existing later deadline wins and
    /// an exhausted backend stays exhausted.
    pub fn mark_cooling(&mut self, name: &str, until: DateTime<Utc>, reason: FailureReason) {
        let Some(backend) = self.backends.iter_mut().find(|b| b.name == name) else {
            return;
        };
        if backend.health == BackendHealth::Exhausted {
            return;
        }
        let until = match backend.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        backend.health = BackendHealth::CoolingDown;
        backend.cooldown_until = Some(until);
        backend.last_reason = Some(reason);
    }

    pub fn mark_exhausted(&mut self, name: &str, reason: FailureReason) {
        if let Some(backend) = self.backends.iter_mut().find(|b| b.name == name) {
            backend.health = BackendHealth::Exhausted;
            backend.cooldown_until = None;
            backend.last_reason = Some(reason);
        }
    }

    pub fn all_exhausted(&self) -> bool {
        self.backends
            .iter()
            .all(|b| b.health == BackendHealth::Exhausted)
    }

    /// Earliest pending cool-down deadline, if any backend is cooling down.
    pub fn earliest_cooldown(&self) -> Option<DateTime<Utc>> {
        self.backends
            .iter()
            .filter(|b| b.health == BackendHealth::CoolingDown)
            .filter_map(|b| b.cooldown_until)
            .min()
    }

    /// Adopt persisted cool-downs for backends that are still configured.
    ///
    /// Exhaustion is not carried over; every invocation tries exhausted
    /// backends once more.
    pub fn adopt(&mut self, persisted: &[BackendState]) {
        for backend in &mut self.backends {
            if let Some(saved) = persisted
                .iter()
                .find(|p| p.name == backend.name && p.health == BackendHealth::CoolingDown)
            {
                backend.health = saved.health;
                backend.cooldown_until = saved.cooldown_until;
                backend.last_reason = saved.last_reason;
            }
        }
    }
}
