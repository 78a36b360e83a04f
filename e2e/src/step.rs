use std::fmt;
use std::time::{Duration, Instant};

use crate::TractResult;

/// Something an export step produces and can describe in a log line.
pub trait StepArtifact {
    fn describe(&self) -> String;
}

/// Result of a named export step.
#[derive(Debug)]
pub enum StepOutcome<T> {
    Exported { artifact: T, elapsed: Duration },
    Failed { reason: String, elapsed: Duration },
}

impl<T> StepOutcome<T> {
    pub fn elapsed(&self) -> Duration {
        match self {
            StepOutcome::Exported { elapsed, .. } | StepOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }

    pub fn is_exported(&self) -> bool {
        matches!(self, StepOutcome::Exported { .. })
    }

    pub fn artifact(self) -> Option<T> {
        match self {
            StepOutcome::Exported { artifact, .. } => Some(artifact),
            StepOutcome::Failed { .. } => None,
        }
    }
}

/// Run `step`, timing it and capturing its error. Failures are logged and
/// reported in the outcome, never propagated.
pub fn run_step<T, F>(prefix: impl fmt::Display, step: F) -> StepOutcome<T>
where
    T: StepArtifact,
    F: FnOnce() -> TractResult<T>,
{
    let start = Instant::now();
    let result = step();
    let elapsed = start.elapsed();
    match result {
        Ok(artifact) => {
            info!(
                "{prefix} export success ✅ {:.1}s, {}",
                elapsed.as_secs_f32(),
                artifact.describe()
            );
            StepOutcome::Exported { artifact, elapsed }
        }
        Err(e) => {
            let reason = format!("{e:#}");
            info!("{prefix} export failure ❌ {:.1}s: {reason}", elapsed.as_secs_f32());
            StepOutcome::Failed { reason, elapsed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, bail};

    struct Named(&'static str);

    impl StepArtifact for Named {
        fn describe(&self) -> String {
            format!("saved as {}", self.0)
        }
    }

    #[test]
    fn success_carries_artifact() {
        let outcome = run_step("TEST:", || Ok(Named("model.onnx")));
        assert!(outcome.is_exported());
        assert_eq!(outcome.artifact().unwrap().0, "model.onnx");
    }

    #[test]
    fn failure_carries_reason() {
        let outcome: StepOutcome<Named> =
            run_step("TEST:", || Err(anyhow::anyhow!("inner")).context("exporting"));
        assert!(!outcome.is_exported());
        match &outcome {
            StepOutcome::Failed { reason, .. } => assert_eq!(reason, "exporting: inner"),
            _ => panic!(),
        }
        assert!(outcome.artifact().is_none());
    }

    #[test]
    fn not_implemented_is_a_failure() {
        let outcome: StepOutcome<Named> = run_step("TEST:", || bail!("not implemented"));
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }
}
