use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// `beta = 1 - mu - kappa * BETA_C`, recomputed on every accepted change.
pub const BETA_C: f64 = 10.8;

const MU_RANGE: RangeInclusive<f64> = 0.500..=0.700;
const OMEGA_RANGE: RangeInclusive<f64> = 0.500..=1.500;
const KAPPA_RANGE: RangeInclusive<f64> = 0.010..=0.050;

const MU_DEFAULT: f64 = 0.569;
const OMEGA_DEFAULT: f64 = 0.847;
const KAPPA_DEFAULT: f64 = 0.0207;

/// A value is considered changed only if it moves by more than this.
const CHANGE_EPSILON: f64 = 1e-9;

/// One of the three primary parameters. Used as the key type for
/// `LastUpdateTimes` and in conflict descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamName {
    Mu,
    Omega,
    Kappa,
}

impl ParamName {
    pub const ALL: [ParamName; 3] = [ParamName::Mu, ParamName::Omega, ParamName::Kappa];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Mu => "mu",
            ParamName::Omega => "omega",
            ParamName::Kappa => "kappa",
        }
    }
}

/// A partial proposal: any subset of the three primaries, each optional.
/// Mirrors the wire shape `{"mu": 0.6, ...}` exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omega: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kappa: Option<f64>,
}

impl ParamUpdate {
    pub fn is_empty(&self) -> bool {
        self.mu.is_none() && self.omega.is_none() && self.kappa.is_none()
    }

    pub fn get(&self, name: ParamName) -> Option<f64> {
        match name {
            ParamName::Mu => self.mu,
            ParamName::Omega => self.omega,
            ParamName::Kappa => self.kappa,
        }
    }

    pub fn single(name: ParamName, value: f64) -> Self {
        let mut update = ParamUpdate::default();
        match name {
            ParamName::Mu => update.mu = Some(value),
            ParamName::Omega => update.omega = Some(value),
            ParamName::Kappa => update.kappa = Some(value),
        }
        update
    }

    /// Iterate over `(name, value)` pairs actually present in this proposal.
    pub fn iter(&self) -> impl Iterator<Item = (ParamName, f64)> + '_ {
        ParamName::ALL
            .into_iter()
            .filter_map(|name| self.get(name).map(|value| (name, value)))
    }
}

/// Authoritative parameters of one session. `beta` is always consistent
/// with the current primaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub mu: f64,
    pub omega: f64,
    pub kappa: f64,
    pub beta: f64,
}

impl Default for SessionState {
    fn default() -> Self {
        let mut state = SessionState {
            mu: MU_DEFAULT,
            omega: OMEGA_DEFAULT,
            kappa: KAPPA_DEFAULT,
            beta: 0.0,
        };
        state.recompute_beta();
        state
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn recompute_beta(&mut self) {
        self.beta = 1.0 - self.mu - self.kappa * BETA_C;
    }

    /// Current value of one primary field.
    pub fn get(&self, name: ParamName) -> f64 {
        match name {
            ParamName::Mu => self.mu,
            ParamName::Omega => self.omega,
            ParamName::Kappa => self.kappa,
        }
    }

    fn set(&mut self, name: ParamName, value: f64) {
        match name {
            ParamName::Mu => self.mu = value,
            ParamName::Omega => self.omega = value,
            ParamName::Kappa => self.kappa = value,
        }
    }

    fn bounds(name: ParamName) -> RangeInclusive<f64> {
        match name {
            ParamName::Mu => MU_RANGE,
            ParamName::Omega => OMEGA_RANGE,
            ParamName::Kappa => KAPPA_RANGE,
        }
    }

    fn validate(name: ParamName, value: f64) -> Result<(), ValidationError> {
        let range = Self::bounds(name);
        if range.contains(&value) {
            Ok(())
        } else {
            Err(ValidationError {
                field: name.as_str(),
                value,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }

    /// Apply a partial proposal. Validates every touched field against its
    /// bounds before writing anything, so a bounds violation leaves the
    /// state untouched (reject-the-whole-proposal semantics). Returns the
    /// fields whose value actually moved by more than [`CHANGE_EPSILON`].
    pub fn apply(&mut self, update: &ParamUpdate) -> Result<Vec<ParamName>, ValidationError> {
        for (name, value) in update.iter() {
            Self::validate(name, value)?;
        }

        let mut changed = Vec::with_capacity(3);
        for (name, value) in update.iter() {
            if (self.get(name) - value).abs() > CHANGE_EPSILON {
                changed.push(name);
            }
            self.set(name, value);
        }

        self.recompute_beta();
        Ok(changed)
    }

    pub fn snapshot(&self) -> SessionState {
        *self
    }

    /// Restore from a persisted snapshot, ignoring `seq`/`updated_at`
    /// metadata and revalidating bounds (a stale snapshot written by an
    /// older deployment with different bounds must not be trusted blindly).
    pub fn hydrate(&mut self, record: &SessionState) -> Result<(), ValidationError> {
        Self::validate(ParamName::Mu, record.mu)?;
        Self::validate(ParamName::Omega, record.omega)?;
        Self::validate(ParamName::Kappa, record.kappa)?;
        self.mu = record.mu;
        self.omega = record.omega;
        self.kappa = record.kappa;
        self.recompute_beta();
        Ok(())
    }
}

/// A persisted snapshot: state plus the sequence counter it was saved
/// under and the wall-clock instant of the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(flatten)]
    pub state: SessionState,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only per-session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: u64,
    pub user_id: String,
    pub params: ParamUpdate,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_matches_spec_constants() {
        let state = SessionState::default();
        assert_eq!(state.mu, MU_DEFAULT);
        assert_eq!(state.omega, OMEGA_DEFAULT);
        assert_eq!(state.kappa, KAPPA_DEFAULT);
        assert!((state.beta - (1.0 - MU_DEFAULT - KAPPA_DEFAULT * BETA_C)).abs() < 1e-9);
    }

    #[test]
    fn apply_rejects_out_of_bounds_without_mutating() {
        let mut state = SessionState::default();
        let before = state;
        let update = ParamUpdate {
            mu: Some(0.80),
            ..Default::default()
        };
        let err = state.apply(&update).unwrap_err();
        assert_eq!(err.field, "mu");
        assert_eq!(state, before);
    }

    #[test]
    fn apply_rejects_whole_proposal_if_any_field_invalid() {
        let mut state = SessionState::default();
        let before = state;
        // omega is in-bounds but kappa is not; the whole proposal must be rejected.
        let update = ParamUpdate {
            omega: Some(1.0),
            kappa: Some(0.9),
            ..Default::default()
        };
        assert!(state.apply(&update).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn apply_reports_only_actually_changed_fields() {
        let mut state = SessionState::default();
        let update = ParamUpdate {
            mu: Some(MU_DEFAULT), // unchanged
            omega: Some(1.0),     // changed
            ..Default::default()
        };
        let changed = state.apply(&update).unwrap();
        assert_eq!(changed, vec![ParamName::Omega]);
    }

    #[test]
    fn beta_is_always_consistent_with_primaries() {
        let mut state = SessionState::default();
        state
            .apply(&ParamUpdate {
                mu: Some(0.6),
                kappa: Some(0.02),
                ..Default::default()
            })
            .unwrap();
        assert!((state.beta - (1.0 - 0.6 - 0.02 * BETA_C)).abs() < 1e-9);
    }

    #[test]
    fn apply_snapshot_is_idempotent() {
        let mut state = SessionState::default();
        state.apply(&ParamUpdate::single(ParamName::Mu, 0.6)).unwrap();
        let snap = state.snapshot();
        let update = ParamUpdate {
            mu: Some(snap.mu),
            omega: Some(snap.omega),
            kappa: Some(snap.kappa),
        };
        let changed = state.apply(&update).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn hydrate_preserves_primaries_exactly() {
        let mut original = SessionState::default();
        original.apply(&ParamUpdate::single(ParamName::Omega, 1.2)).unwrap();

        let mut restored = SessionState::default();
        restored.hydrate(&original).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn hydrate_rejects_out_of_bounds_snapshot() {
        let bad = SessionState {
            mu: 0.9,
            omega: 1.0,
            kappa: 0.02,
            beta: 0.0,
        };
        let mut state = SessionState::default();
        assert!(state.hydrate(&bad).is_err());
    }
}
