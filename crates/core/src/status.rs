use std::fmt::Write;

use crate::{
    models::{BotStatus, CommitState, IntegrationResult, IntegrationStep},
    util::format_duration,
};

/// A translated commit status: the value reported to the hosting service
/// plus a short human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub state: CommitState,
    pub description: String,
}

/// Map an observed integration status onto a commit-status value.
///
/// Total over every (step, result) pair, including values the CI server
/// introduces after this code was written: an unrecognized step reads as
/// in-progress, an unrecognized result as not-yet-resolved.
pub fn translate(status: &BotStatus) -> CommitStatus {
    if status.step != IntegrationStep::Completed {
        return CommitStatus {
            state: CommitState::Pending,
            description: step_message(&status.step),
        };
    }
    let (state, message) = match &status.result {
        IntegrationResult::Succeeded => (CommitState::Success, "Build succeeded".to_string()),
        // Policy: warnings do not fail the gate.
        IntegrationResult::Warnings => {
            (CommitState::Success, "Build passed with warnings".to_string())
        }
        IntegrationResult::AnalyzerWarnings => {
            (CommitState::Success, "Build passed with analyzer warnings".to_string())
        }
        IntegrationResult::BuildErrors => (CommitState::Failure, "Build failed".to_string()),
        IntegrationResult::TestFailures => (CommitState::Failure, "Tests failed".to_string()),
        IntegrationResult::BuildFailed => {
            (CommitState::Failure, "Build failed to complete".to_string())
        }
        IntegrationResult::CheckoutError => {
            (CommitState::Failure, "Source checkout failed".to_string())
        }
        IntegrationResult::TriggerError => {
            (CommitState::Failure, "A build trigger failed".to_string())
        }
        IntegrationResult::Canceled => (CommitState::Failure, "Build canceled".to_string()),
        IntegrationResult::InternalError
        | IntegrationResult::InternalCheckoutError
        | IntegrationResult::InternalBuildError
        | IntegrationResult::InternalProcessingError => {
            (CommitState::Error, "An internal CI server error occurred".to_string())
        }
        IntegrationResult::Unknown => {
            (CommitState::Pending, "Waiting for build result".to_string())
        }
        IntegrationResult::Unrecognized(value) => {
            tracing::warn!(bot = %status.bot_name, %value, "Unrecognized integration result");
            (CommitState::Pending, format!("Build finished with unrecognized result '{value}'"))
        }
    };
    let description = match counts_suffix(status) {
        Some(suffix) => format!("{message} ({suffix})."),
        None => format!("{message}."),
    };
    CommitStatus { state, description }
}

fn step_message(step: &IntegrationStep) -> String {
    match step {
        IntegrationStep::Pending => "Build pending…".to_string(),
        IntegrationStep::Preparing => "Preparing build…".to_string(),
        IntegrationStep::Checkout => "Checking out sources…".to_string(),
        IntegrationStep::BeforeTriggers => "Running pre-build triggers…".to_string(),
        IntegrationStep::Building => "Building…".to_string(),
        IntegrationStep::Testing => "Testing…".to_string(),
        IntegrationStep::Archiving => "Archiving…".to_string(),
        IntegrationStep::Processing => "Processing results…".to_string(),
        IntegrationStep::AfterTriggers => "Running post-build triggers…".to_string(),
        IntegrationStep::Uploading => "Uploading results…".to_string(),
        // Unreachable from translate(), kept for totality.
        IntegrationStep::Completed => "Build completed".to_string(),
        IntegrationStep::Unrecognized(value) => format!("Running step '{value}'…"),
    }
}

fn count(n: u64, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// Render the available counts as a comma-separated fragment. A count the
/// server did not report is omitted, not rendered as zero.
fn counts_suffix(status: &BotStatus) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(errors) = status.error_count {
        if errors > 0 {
            parts.push(count(errors, "error"));
        }
    }
    if let Some(warnings) = status.warning_count {
        if warnings > 0 {
            parts.push(count(warnings, "warning"));
        }
    }
    if let Some(warnings) = status.analyzer_warning_count {
        if warnings > 0 {
            parts.push(count(warnings, "analyzer warning"));
        }
    }
    match (status.test_failure_count, status.test_count) {
        (Some(failed), Some(total)) if failed > 0 => {
            parts.push(format!("{failed} of {total} tests failed"));
        }
        (Some(0) | None, Some(total)) if total > 0 => {
            parts.push(format!("{total} tests passed"));
        }
        _ => {}
    }
    if let Some(coverage) = status.code_coverage_percentage {
        parts.push(format!("{coverage:.0}% coverage"));
    }
    if parts.is_empty() { None } else { Some(parts.join(", ")) }
}

/// One-line summary of a bot's latest integration, for display.
pub fn summary(status: &BotStatus) -> String {
    let commit = translate(status);
    let mut line = match status.integration_number {
        Some(n) => format!("{} #{}: {}", status.bot_name, n, commit.description),
        None => format!("{}: {}", status.bot_name, commit.description),
    };
    if let Some(duration) = status.duration() {
        let _ = write!(line, " in {}", format_duration(duration));
    }
    line
}

/// Markdown comment body posted on the PR when an integration completes.
pub fn detail_comment(status: &BotStatus) -> String {
    let commit = translate(status);
    let mut out = match status.integration_number {
        Some(n) => format!("### {} — integration #{}\n\n", status.bot_name, n),
        None => format!("### {}\n\n", status.bot_name),
    };
    let _ = writeln!(out, "**{}**\n", commit.description);
    let _ = writeln!(out, "- Result: `{}`", status.result);
    if let Some(duration) = status.duration() {
        let _ = writeln!(out, "- Duration: {}", format_duration(duration));
    }
    if let Some(errors) = status.error_count {
        let _ = writeln!(out, "- Errors: {errors}");
    }
    if let Some(warnings) = status.warning_count {
        let _ = writeln!(out, "- Warnings: {warnings}");
    }
    if let Some(warnings) = status.analyzer_warning_count {
        let _ = writeln!(out, "- Analyzer warnings: {warnings}");
    }
    if let Some(total) = status.test_count {
        match status.test_failure_count {
            Some(failed) if failed > 0 => {
                let _ = writeln!(out, "- Tests: {failed} of {total} failed");
            }
            _ => {
                let _ = writeln!(out, "- Tests: {total} passed");
            }
        }
    }
    if let Some(coverage) = status.code_coverage_percentage {
        let _ = writeln!(out, "- Code coverage: {coverage:.0}%");
    }
    out
}
