use super::engine::RequirementInformation;
use crate::types::Candidate;

/// Progress callbacks for a resolution run. All methods have empty default
/// bodies so reporters only implement what they surface.
pub trait Reporter {
    /// The resolution is about to start.
    fn starting(&self) {}

    /// A new round begins.
    fn starting_round(&self, _index: usize) {}

    /// A candidate was pinned.
    fn pinning(&self, _candidate: &Candidate) {}

    /// The engine is about to backtrack out of a conflict.
    fn resolving_conflicts(&self, _causes: &[RequirementInformation]) {}

    /// A round finished.
    fn ending_round(&self, _index: usize) {}

    /// The resolution reached a fixed point with `resolved` pins.
    fn ending(&self, _resolved: usize) {}

    /// A non-fatal package warning was emitted by the repository layer.
    fn warn_package(&self, _message: &str) {}
}

/// A reporter that narrates progress to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn starting(&self) {
        tracing::debug!("starting the resolution");
    }

    fn pinning(&self, candidate: &Candidate) {
        tracing::info!("pinned {candidate}");
    }

    fn resolving_conflicts(&self, causes: &[RequirementInformation]) {
        for cause in causes {
            tracing::debug!("conflict cause: {cause}");
        }
    }

    fn ending(&self, resolved: usize) {
        tracing::debug!("resolution finished with {resolved} pins");
    }

    fn warn_package(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// A reporter that swallows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl Reporter for SilentReporter {}
