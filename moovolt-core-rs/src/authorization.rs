//! Authorization & billing engine
//!
//! The coordinator only sees the `AuthorizationEngine` contract. The
//! `StaticAuthorization` engine answers from a customer table loaded at
//! startup and a flat tariff; it keeps the consumed credit in memory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::SessionSummary;
use crate::types::{AuthorizationDecision, ChargePointId, CredentialRef, DenialReason, SettlementOutcome};

/// The engine could not produce an answer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization engine unavailable: {0}")]
    Unavailable(String),

    #[error("authorization engine did not answer in time")]
    Timeout,
}

/// Failure loading the customer table
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("reading profiles: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing profiles: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Business-rule evaluator consulted by the coordinator
#[async_trait]
pub trait AuthorizationEngine: Send + Sync {
    async fn evaluate(
        &self,
        credential: &CredentialRef,
        charge_point_id: &ChargePointId,
    ) -> Result<AuthorizationDecision, AuthError>;

    async fn settle(&self, summary: &SessionSummary) -> Result<SettlementOutcome, AuthError>;
}

/// Customer record, as captured by the intake form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub credential: CredentialRef,
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub national_id: String,
    pub region_code: String,
    /// Subscribed product, decides the energy cap
    pub product_ref: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub credit_limit_cents: u64,
}

/// Table-driven engine
#[derive(Debug)]
pub struct StaticAuthorization {
    profiles: HashMap<CredentialRef, CustomerProfile>,
    tariff_cents_per_kwh: u64,
    product_caps: HashMap<String, f64>,
    default_cap_kwh: f64,
    blocked: HashSet<CredentialRef>,
    /// Credit consumed by captured settlements
    spent: Mutex<HashMap<CredentialRef, u64>>,
}

impl StaticAuthorization {
    pub fn new(tariff_cents_per_kwh: u64) -> Self {
        Self {
            profiles: HashMap::new(),
            tariff_cents_per_kwh,
            product_caps: HashMap::new(),
            default_cap_kwh: 80.0,
            blocked: HashSet::new(),
            spent: Mutex::new(HashMap::new()),
        }
    }

    /// Load customer profiles from a JSON array
    pub fn from_profiles_file(path: impl AsRef<Path>, tariff_cents_per_kwh: u64) -> Result<Self, ProfileError> {
        let data = fs::read_to_string(path.as_ref())?;
        let profiles: Vec<CustomerProfile> = serde_json::from_str(&data)?;
        info!(
            "Authorization: loaded {} profiles from {:?}",
            profiles.len(),
            path.as_ref()
        );
        Ok(profiles
            .into_iter()
            .fold(Self::new(tariff_cents_per_kwh), |engine, p| engine.with_profile(p)))
    }

    pub fn with_profile(mut self, profile: CustomerProfile) -> Self {
        self.profiles.insert(profile.credential.clone(), profile);
        self
    }

    pub fn with_product_cap(mut self, product_ref: impl Into<String>, cap_kwh: f64) -> Self {
        self.product_caps.insert(product_ref.into(), cap_kwh);
        self
    }

    /// Cap for products without an explicit entry
    pub fn with_default_cap(mut self, cap_kwh: f64) -> Self {
        self.default_cap_kwh = cap_kwh;
        self
    }

    pub fn block(&mut self, credential: CredentialRef) {
        self.blocked.insert(credential);
    }

    pub fn profile(&self, credential: &CredentialRef) -> Option<&CustomerProfile> {
        self.profiles.get(credential)
    }

    pub fn tariff_cents_per_kwh(&self) -> u64 {
        self.tariff_cents_per_kwh
    }

    /// Credit still available to a customer
    pub fn remaining_cents(&self, credential: &CredentialRef) -> Option<u64> {
        let profile = self.profiles.get(credential)?;
        let spent = self.spent.lock().get(credential).copied().unwrap_or(0);
        Some(profile.credit_limit_cents.saturating_sub(spent))
    }

    fn cap_for(&self, profile: &CustomerProfile) -> f64 {
        self.product_caps
            .get(&profile.product_ref)
            .copied()
            .unwrap_or(self.default_cap_kwh)
    }

    /// Cents charged for `energy_kwh`, rounded up
    pub fn price_cents(&self, energy_kwh: f64) -> u64 {
        (energy_kwh.max(0.0) * self.tariff_cents_per_kwh as f64).ceil() as u64
    }
}

#[async_trait]
impl AuthorizationEngine for StaticAuthorization {
    async fn evaluate(
        &self,
        credential: &CredentialRef,
        charge_point_id: &ChargePointId,
    ) -> Result<AuthorizationDecision, AuthError> {
        let Some(profile) = self.profiles.get(credential) else {
            warn!("Authorization: unknown credential {} at {}", credential, charge_point_id);
            return Ok(AuthorizationDecision::Denied {
                reason: DenialReason::UnknownCredential,
            });
        };

        if self.blocked.contains(credential) {
            warn!("Authorization: blocked credential {} at {}", credential, charge_point_id);
            return Ok(AuthorizationDecision::Denied {
                reason: DenialReason::Blocked,
            });
        }

        let remaining = self.remaining_cents(credential).unwrap_or(0);
        if remaining == 0 {
            return Ok(AuthorizationDecision::Denied {
                reason: DenialReason::NoCredit,
            });
        }

        let cap = self.cap_for(profile);
        let limit_kwh = if self.tariff_cents_per_kwh == 0 {
            cap
        } else {
            cap.min(remaining as f64 / self.tariff_cents_per_kwh as f64)
        };

        debug!(
            "Authorization: {} approved at {} for {:.3} kWh ({} cents left)",
            credential, charge_point_id, limit_kwh, remaining
        );
        Ok(AuthorizationDecision::Approved { limit_kwh })
    }

    async fn settle(&self, summary: &SessionSummary) -> Result<SettlementOutcome, AuthError> {
        let Some(profile) = self.profiles.get(&summary.credential) else {
            return Ok(SettlementOutcome::Failed {
                reason: "unknown credential".into(),
            });
        };

        // Energy past the granted limit is delivered while the stop is in
        // flight and is not billed
        let granted = match summary.decision {
            Some(AuthorizationDecision::Approved { limit_kwh }) if summary.energy_kwh > limit_kwh => Some(limit_kwh),
            _ => None,
        };
        let billed_kwh = granted.unwrap_or(summary.energy_kwh);

        let mut amount_cents = self.price_cents(billed_kwh);
        let mut spent = self.spent.lock();
        let used = spent.entry(summary.credential.clone()).or_insert(0);
        let remaining = profile.credit_limit_cents.saturating_sub(*used);
        if granted.is_some() {
            // granted energy never costs more than the credit left
            amount_cents = amount_cents.min(remaining);
            debug!(
                "Authorization: session {} overshot its grant by {:.3} kWh",
                summary.session_id,
                summary.energy_kwh - billed_kwh
            );
        }

        if amount_cents > remaining {
            warn!(
                "Authorization: session {} needs {} cents, {} has {} left",
                summary.session_id, amount_cents, summary.credential, remaining
            );
            return Ok(SettlementOutcome::Failed {
                reason: "credit exceeded".into(),
            });
        }

        *used += amount_cents;
        info!(
            "Authorization: captured {} cents for session {} ({:.3} kWh)",
            amount_cents, summary.session_id, billed_kwh
        );
        Ok(SettlementOutcome::Captured {
            amount_cents,
            energy_kwh: billed_kwh,
        })
    }
}
