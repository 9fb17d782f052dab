//! Two-phase validation pipeline and the validator/processor contracts.
//!
//! Critical validators run sequentially in declaration order and abort the
//! run on the first failure; they are the cheap gates that keep adversarial
//! input away from the heavy decoders. Standard validators then run in
//! parallel on the rayon pool. Results from the standard phase are appended
//! in completion order, which is not stable; callers must not rely on it.

mod context;
mod policy;
mod result;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;

use tracing::{debug, warn};

pub use context::AssetContext;
pub use policy::ValidationPolicy;
pub use result::{
    Metadata, ModelProcessingOutput, ProcessingResult, ValidationErrorCode, ValidationResult,
};

/// A single synchronous check over an asset.
///
/// Implementations must not panic out of `validate`; failures are reported
/// through the returned [`ValidationResult`]. The pipeline still catches
/// unwinds as a last line of defense and converts them into failed results
/// with [`ValidationErrorCode::Unknown`].
pub trait Validator: Send + Sync {
    /// Stable name used in results and logs.
    fn name(&self) -> &'static str;

    /// Whether a failure of this check aborts the pipeline before the
    /// standard phase runs.
    fn is_critical(&self) -> bool {
        false
    }

    /// Performs the check.
    fn validate(&self, context: &AssetContext, policy: &ValidationPolicy) -> ValidationResult;
}

/// A synchronous transform producing derived artifacts next to the input.
///
/// Processors may write sibling files into the input's directory and must
/// report their paths; uploading and deleting them is the worker's job.
pub trait Processor: Send + Sync {
    /// The artifact type this processor produces.
    type Output;

    /// Stable name used in results and logs.
    fn name(&self) -> &'static str;

    /// Transforms the asset, never propagating errors past the boundary.
    fn process(&self, context: &AssetContext) -> ProcessingResult<Self::Output>;
}

/// Ordered set of validators executed in two phases.
pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    /// Creates a pipeline from validators in declaration order.
    #[must_use]
    pub fn new(validators: Vec<Box<dyn Validator>>) -> Self {
        Self { validators }
    }

    /// Runs the critical phase, then the standard phase.
    ///
    /// Returns every result produced so far; a critical failure returns the
    /// partial list without running any standard validator.
    pub fn run(&self, context: &AssetContext, policy: &ValidationPolicy) -> Vec<ValidationResult> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(self.validators.len());

        debug!(
            trace_id = context.trace_id(),
            file = %context.file_path().display(),
            hint = context.file_type_hint(),
            "starting validation pipeline"
        );

        for validator in self.validators.iter().filter(|v| v.is_critical()) {
            let result = execute_validator(validator.as_ref(), context, policy);
            let failed = !result.is_valid;
            let name = result.validator_name.clone();
            results.push(result);
            if failed {
                warn!(
                    trace_id = context.trace_id(),
                    validator = %name,
                    "critical validator failed, aborting pipeline"
                );
                return results;
            }
        }

        let standard: Vec<&dyn Validator> = self
            .validators
            .iter()
            .filter(|v| !v.is_critical())
            .map(|v| &**v)
            .collect();

        if !standard.is_empty() {
            let (tx, rx) = mpsc::channel();
            rayon::scope(|scope| {
                for validator in standard {
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let _ = tx.send(execute_validator(validator, context, policy));
                    });
                }
                drop(tx);
                // Receiving inside the scope yields completion order.
                for result in rx {
                    debug!(
                        trace_id = context.trace_id(),
                        validator = %result.validator_name,
                        duration_ms = result.duration.as_millis(),
                        valid = result.is_valid,
                        "validator finished"
                    );
                    results.push(result);
                }
            });
        }

        let elapsed = started.elapsed();
        if elapsed > policy.timeout {
            warn!(
                trace_id = context.trace_id(),
                elapsed_ms = elapsed.as_millis(),
                budget_ms = policy.timeout.as_millis(),
                "validation pipeline exceeded its time budget"
            );
        }

        results
    }
}

/// Runs one validator with timing, converting unwinds into failed results.
fn execute_validator(
    validator: &dyn Validator,
    context: &AssetContext,
    policy: &ValidationPolicy,
) -> ValidationResult {
    let started = Instant::now();

    let mut result =
        match panic::catch_unwind(AssertUnwindSafe(|| validator.validate(context, policy))) {
            Ok(result) => result,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                ValidationResult::invalid(
                    validator.name(),
                    ValidationErrorCode::Unknown,
                    format!("validator crashed: {detail}"),
                )
            }
        };

    result.duration = started.elapsed();
    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
