// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Enum gauge for service health: exactly one state reads 1.

use prometheus::{IntGaugeVec, Registry, register_int_gauge_vec_with_registry};

/// Health states a service moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Serving requests.
    Healthy,
    /// Running but degraded.
    Unhealthy,
    /// Not running.
    Dead,
    /// Draining after SIGTERM.
    Terminating,
}

impl HealthState {
    /// All states in label order.
    pub const ALL: [HealthState; 4] = [
        HealthState::Healthy,
        HealthState::Unhealthy,
        HealthState::Dead,
        HealthState::Terminating,
    ];

    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Dead => "dead",
            Self::Terminating => "terminating",
        }
    }
}

/// `khaleesi_health`
pub struct HealthMetric {
    gauge: IntGaugeVec,
}

impl HealthMetric {
    pub(crate) fn new(registry: &Registry) -> prometheus::Result<Self> {
        let gauge = register_int_gauge_vec_with_registry!(
            "khaleesi_health",
            "Current health state of the service",
            &["khaleesi_health"],
            registry,
        )?;
        Ok(Self { gauge })
    }

    /// Switch to `state`.
    pub fn set(&self, state: HealthState) {
        for candidate in HealthState::ALL {
            self.gauge
                .with_label_values(&[candidate.as_str()])
                .set(i64::from(candidate == state));
        }
    }

    /// The active state, if one was ever set.
    pub fn current(&self) -> Option<HealthState> {
        HealthState::ALL
            .into_iter()
            .find(|state| self.gauge.with_label_values(&[state.as_str()]).get() == 1)
    }
}
