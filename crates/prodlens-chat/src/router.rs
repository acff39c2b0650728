//! Intent routing.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use prodlens_core::config::RoutingConfig;
use prodlens_core::error::Result;
use prodlens_core::prompts::{context, PromptLibrary, ROUTER_SYSTEM};
use prodlens_core::services::DecisionGenerator;
use prodlens_core::types::Route;

use crate::deadline::bounded;
use crate::decision::{route_schema, LabelDecision};
use crate::error::TurnError;

/// Which routes exist and where unusable decisions land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub small_talk_enabled: bool,
    pub fallback: Route,
}

impl RoutingPolicy {
    /// Map a raw label onto an available route.
    pub fn accept(&self, label: &str) -> Option<Route> {
        match Route::from_label(label)? {
            Route::SmallTalk if !self.small_talk_enabled => None,
            route => Some(route),
        }
    }
}

impl From<&RoutingConfig> for RoutingPolicy {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            small_talk_enabled: config.small_talk_enabled,
            fallback: config.fallback_route,
        }
    }
}

/// Routing outcome. `reasoning` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub route: Route,
    pub reasoning: String,
    pub error: Option<TurnError>,
}

pub struct IntentRouter {
    decisions: Arc<dyn DecisionGenerator>,
    prompts: Arc<PromptLibrary>,
    policy: RoutingPolicy,
    timeout_secs: u64,
}

impl IntentRouter {
    pub fn new(
        decisions: Arc<dyn DecisionGenerator>,
        prompts: Arc<PromptLibrary>,
        policy: RoutingPolicy,
        timeout_secs: u64,
    ) -> Self {
        Self {
            decisions,
            prompts,
            policy,
            timeout_secs,
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Classify `query`. Never fails: errors and unknown labels become the
    /// policy's fallback route.
    pub async fn route(&self, query: &str) -> RouteDecision {
        let started = Instant::now();
        let decision = match self.call(query).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, fallback = %self.policy.fallback, "Routing failed");
                return RouteDecision {
                    route: self.policy.fallback,
                    reasoning: format!(
                        "routing unavailable; defaulted to {}",
                        self.policy.fallback
                    ),
                    error: Some(TurnError::Routing(e.to_string())),
                };
            }
        };

        let reasoning = decision
            .reasoning
            .unwrap_or_else(|| "no reasoning given".to_string());
        let routed = match decision.label.as_deref() {
            Some(label) => match self.policy.accept(label) {
                Some(route) => RouteDecision {
                    route,
                    reasoning,
                    error: None,
                },
                None => self.coerce(format!("unrecognized route {:?}", label)),
            },
            None => self.coerce("decision had no route".to_string()),
        };

        info!(
            route = %routed.route,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query routed"
        );
        routed
    }

    fn coerce(&self, problem: String) -> RouteDecision {
        warn!(problem = %problem, fallback = %self.policy.fallback, "Coercing route");
        RouteDecision {
            route: self.policy.fallback,
            reasoning: format!("{}; defaulted to {}", problem, self.policy.fallback),
            error: Some(TurnError::Routing(problem)),
        }
    }

    async fn call(&self, query: &str) -> Result<LabelDecision> {
        let system = self.prompts.render(
            ROUTER_SYSTEM,
            context! { small_talk_enabled => self.policy.small_talk_enabled },
        )?;
        let schema = route_schema(self.policy.small_talk_enabled);
        let value = bounded(
            self.timeout_secs,
            self.decisions.decide(&system, query, &schema),
        )
        .await?;
        Ok(LabelDecision::parse(&value, "route"))
    }
}
