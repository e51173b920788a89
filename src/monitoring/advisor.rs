//! Handler Advisor
//!
//! Turns accumulated handler metrics into advisory recommendations. The
//! advisor only reads; acting on a recommendation is left to an operator.

use serde::Serialize;

use crate::handlers::RegistrationInfo;

use super::metrics::HandlerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Average duration above the slow threshold
    Slow,
    /// Failure rate above the faulty threshold
    Faulty,
    /// Registered and active but never invoked
    Unused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub handler_type: String,
    pub kind: RecommendationKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct HandlerAdvisor {
    pub slow_threshold_ms: f64,
    pub faulty_threshold: f64,
    /// Invocations needed before slow/faulty is judged
    pub min_invocations: u64,
}

impl Default for HandlerAdvisor {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 5_000.0,
            faulty_threshold: 0.25,
            min_invocations: 5,
        }
    }
}

impl HandlerAdvisor {
    pub fn recommend(
        &self,
        stats: &[HandlerStats],
        registrations: &[RegistrationInfo],
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        for stat in stats.iter().filter(|s| s.invocations >= self.min_invocations) {
            if let Some(avg) = stat.avg_duration_ms() {
                if avg > self.slow_threshold_ms {
                    recommendations.push(Recommendation {
                        handler_type: stat.handler_type.clone(),
                        kind: RecommendationKind::Slow,
                        detail: format!(
                            "average {:.0} ms over {} invocations (threshold {:.0} ms)",
                            avg, stat.invocations, self.slow_threshold_ms
                        ),
                    });
                }
            }
            if let Some(rate) = stat.failure_rate() {
                if rate > self.faulty_threshold {
                    recommendations.push(Recommendation {
                        handler_type: stat.handler_type.clone(),
                        kind: RecommendationKind::Faulty,
                        detail: format!(
                            "{} of {} invocations failed ({:.0}%)",
                            stat.failures,
                            stat.invocations,
                            rate * 100.0
                        ),
                    });
                }
            }
        }

        for registration in registrations.iter().filter(|r| r.active) {
            let invoked = stats
                .iter()
                .any(|s| s.handler_type == registration.handler_type && s.invocations > 0);
            if !invoked {
                recommendations.push(Recommendation {
                    handler_type: registration.handler_type.clone(),
                    kind: RecommendationKind::Unused,
                    detail: format!("{} handler has never been invoked", registration.kind),
                });
            }
        }

        recommendations
    }
}
