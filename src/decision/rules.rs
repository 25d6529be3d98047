use super::{Decision, DecisionContext, DecisionFunction, DecisionFuture};
use crate::thresholds::{AdaptiveThresholdAdjuster, ThresholdHandle};

/// Default decision function: a small rule table over `status.cpu` and
/// `status.severity`.
pub struct RuleBasedDecider {
    thresholds: ThresholdHandle,
    adjuster: Option<AdaptiveThresholdAdjuster>,
}

impl RuleBasedDecider {
    pub fn new(thresholds: ThresholdHandle) -> Self {
        Self {
            thresholds,
            adjuster: None,
        }
    }

    /// Consult decision history so a long monitor streak tightens the alert level.
    pub fn with_adjuster(mut self, adjuster: AdaptiveThresholdAdjuster) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    fn evaluate(&self, context: &DecisionContext) -> Decision {
        let thresholds = self.thresholds.load();
        let cpu = context.get_f64("status.cpu").unwrap_or(0.0);
        let severity = context.get_str("status.severity").unwrap_or("none");
        let justification = format!("cpu={cpu}, severity={severity}");
        let lowered = self
            .adjuster
            .as_ref()
            .is_some_and(AdaptiveThresholdAdjuster::should_lower_threshold);

        let (decision, confidence) = if lowered && cpu > thresholds.cpu_lowered_alert {
            ("reduce_load", 0.75)
        } else if severity == "critical" {
            ("emergency_shutdown", 1.0)
        } else if cpu > thresholds.cpu_alert {
            ("reduce_load", 0.8)
        } else if cpu > thresholds.cpu_watch {
            ("monitor", 0.6)
        } else {
            ("normal", 0.4)
        };
        Decision::new(decision, confidence, justification)
    }
}

impl DecisionFunction for RuleBasedDecider {
    fn name(&self) -> &str {
        "rules"
    }

    fn decide<'a>(&'a self, context: &'a DecisionContext) -> DecisionFuture<'a> {
        let decision = self.evaluate(context);
        Box::pin(async move { Ok(decision) })
    }
}
