mod context;
mod rules;

pub use context::{DecisionContext, FileContextSource};
pub use rules::RuleBasedDecider;

use crate::error::DecisionError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// One output of a decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub confidence: f64,
    pub justification: String,
}

impl Decision {
    pub fn new(
        decision: impl Into<String>,
        confidence: f64,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            decision: decision.into(),
            confidence,
            justification: justification.into(),
        }
    }

    /// A confidence outside `[0, 1]` (or NaN) is an integrity violation.
    pub fn validated(self) -> Result<Self, DecisionError> {
        if self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence) {
            Ok(self)
        } else {
            Err(DecisionError::IntegrityViolation(format!(
                "confidence {} outside [0, 1] for decision '{}'",
                self.confidence, self.decision
            )))
        }
    }
}

pub type DecisionFuture<'a> = Pin<Box<dyn Future<Output = Result<Decision, DecisionError>> + Send + 'a>>;

/// The opaque step the kernel protects.
///
/// Implementations read the per-tick context and either produce a
/// [`Decision`] or fail with a [`DecisionError`]. Anything that is not part of
/// the domain taxonomy should be reported as [`DecisionError::Unexpected`].
pub trait DecisionFunction: Send + Sync {
    /// Short label used in events and logs.
    fn name(&self) -> &str;

    fn decide<'a>(&'a self, context: &'a DecisionContext) -> DecisionFuture<'a>;
}
