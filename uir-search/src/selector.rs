//! Health-aware provider selection.
//!
//! Given the providers a caller asked for, the selector decides which ones
//! to call, in what order, and which to hold back as fallbacks:
//!
//! 1. Unknown, incapable or forbidden providers are rejected with an error
//!    outcome and never called.
//! 2. The rest are tiered: healthy first, then degraded.
//! 3. Unhealthy providers (including open circuits) are skipped, unless no
//!    other candidate exists, in which case they are attempted as a last
//!    resort and the response is flagged as degraded service.
//! 4. Ties within a tier follow the configured [`LoadBalancing`] strategy.
//! 5. The ordered list is cut at the fan-out limit; the overflow and any
//!    caller-named fallback providers become the fallback batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::access::AccessPolicy;
use crate::config::LoadBalancing;
use crate::error::ProviderError;
use crate::health::HealthState;
use crate::registry::{ProviderEntry, RegistrySnapshot};
use crate::types::Capability;

/// Inputs for one selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    /// Providers the caller asked for, in preference order.
    pub requested: &'a [String],
    /// Providers to try only if every primary fails.
    pub fallbacks: &'a [String],
    /// Capability the operation needs.
    pub capability: Capability,
    /// Maximum primaries to call concurrently.
    pub max_fan_out: usize,
    /// Caller identity for the access policy.
    pub caller: Option<&'a str>,
}

/// The selector's decision.
#[derive(Debug, Default)]
pub struct Selection {
    /// Providers to call concurrently, best first.
    pub primary: Vec<Arc<ProviderEntry>>,
    /// Providers to call if all primaries fail.
    pub fallback: Vec<Arc<ProviderEntry>>,
    /// Providers refused before any call, with the reason.
    pub rejected: Vec<(String, ProviderError)>,
    /// Unhealthy providers left out.
    pub skipped: Vec<String>,
    /// True when only unhealthy providers were available.
    pub degraded_service: bool,
}

struct Candidate {
    entry: Arc<ProviderEntry>,
    tier: HealthState,
    position: usize,
}

/// Orders providers by health and load-balancing strategy.
pub struct ProviderSelector {
    strategy: LoadBalancing,
    cursor: AtomicUsize,
    access: Arc<dyn AccessPolicy>,
}

impl ProviderSelector {
    /// Create a selector.
    pub fn new(strategy: LoadBalancing, access: Arc<dyn AccessPolicy>) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            access,
        }
    }

    /// Whether `caller` may use `provider` at all.
    pub fn permits(&self, caller: Option<&str>, provider: &str) -> bool {
        self.access.can_use(caller, provider)
    }

    /// Select providers for one operation.
    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        request: &SelectionRequest<'_>,
        now: Instant,
    ) -> Selection {
        let mut selection = Selection::default();
        let mut seen = HashSet::new();

        let mut usable = Vec::new();
        let mut unhealthy = Vec::new();
        for (position, name) in request.requested.iter().enumerate() {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let Some(entry) = self.admissible(snapshot, name, request, &mut selection) else {
                continue;
            };
            let tier = if entry.is_circuit_open(now) {
                HealthState::Unhealthy
            } else {
                entry.health_state(now)
            };
            let candidate = Candidate {
                entry: Arc::clone(entry),
                tier,
                position,
            };
            if tier == HealthState::Unhealthy {
                unhealthy.push(candidate);
            } else {
                usable.push(candidate);
            }
        }

        if usable.is_empty() && !unhealthy.is_empty() {
            tracing::warn!(
                count = unhealthy.len(),
                "only unhealthy providers available; attempting as last resort"
            );
            selection.degraded_service = true;
            usable = unhealthy;
        } else {
            selection.skipped = unhealthy
                .into_iter()
                .map(|c| c.entry.name().to_string())
                .collect();
        }

        let ordered = self.order(usable);
        let fan_out = request.max_fan_out.max(1);
        let mut ordered = ordered.into_iter();
        selection.primary = ordered.by_ref().take(fan_out).collect();
        selection.fallback = ordered.collect();

        for name in request.fallbacks {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if let Some(entry) = self.admissible(snapshot, name, request, &mut selection) {
                if entry.is_circuit_open(now) {
                    selection.skipped.push(name.clone());
                } else {
                    selection.fallback.push(Arc::clone(entry));
                }
            }
        }

        selection
    }

    fn admissible<'s>(
        &self,
        snapshot: &'s RegistrySnapshot,
        name: &str,
        request: &SelectionRequest<'_>,
        selection: &mut Selection,
    ) -> Option<&'s Arc<ProviderEntry>> {
        let Some(entry) = snapshot.get(name) else {
            selection.rejected.push((
                name.to_string(),
                ProviderError::InvalidRequest(format!("unknown provider {name}")),
            ));
            return None;
        };
        if !entry.supports(request.capability) {
            selection.rejected.push((
                name.to_string(),
                ProviderError::Unsupported(format!(
                    "{name} does not support {}",
                    request.capability
                )),
            ));
            return None;
        }
        if !self.access.can_use(request.caller, name) {
            selection.rejected.push((
                name.to_string(),
                ProviderError::AccessDenied(format!("caller may not use {name}")),
            ));
            return None;
        }
        Some(entry)
    }

    /// Sort by tier, breaking ties within a tier by the load-balancing strategy.
    fn order(&self, mut candidates: Vec<Candidate>) -> Vec<Arc<ProviderEntry>> {
        candidates.sort_by_key(|c| (c.tier, c.position));

        let rotation = match self.strategy {
            LoadBalancing::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        let mut ordered = Vec::with_capacity(candidates.len());
        let mut start = 0;
        while start < candidates.len() {
            let tier = candidates[start].tier;
            let end = candidates[start..]
                .iter()
                .position(|c| c.tier != tier)
                .map_or(candidates.len(), |offset| start + offset);
            let group = &mut candidates[start..end];
            match self.strategy {
                LoadBalancing::HealthOnly => {}
                LoadBalancing::RoundRobin => {
                    let len = group.len();
                    group.rotate_left(rotation % len);
                }
                LoadBalancing::InverseLatency => {
                    group.sort_by(|a, b| {
                        inverse_latency(&b.entry)
                            .total_cmp(&inverse_latency(&a.entry))
                            .then_with(|| a.entry.name().cmp(b.entry.name()))
                    });
                }
            }
            ordered.extend(group.iter().map(|c| Arc::clone(&c.entry)));
            start = end;
        }
        ordered
    }
}

fn inverse_latency(entry: &ProviderEntry) -> f64 {
    entry.policy().weight / entry.latency_ema_ms().max(1.0)
}
