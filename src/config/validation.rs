//! Sanity checks for autoscaling options
//!
//! Errors reject the options outright; warnings are logged and the options
//! are used as given.

use serde::{Deserialize, Serialize};

use super::options::AutoscalingOptions;

/// Validation result with severity levels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ValidationSeverity {
    /// May work but is probably not what was meant
    Warning,
    /// Cannot work
    Error,
}

/// A single validation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: ValidationSeverity,
    /// Option the message is about
    pub field: String,
    pub message: String,
}

/// All messages for one set of options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: ValidationSeverity::Error,
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warning(&mut self, field: &str, message: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: ValidationSeverity::Warning,
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.severity == ValidationSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == ValidationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == ValidationSeverity::Warning)
    }
}

/// Check options for values the control loop cannot work with
pub fn validate_options(options: &AutoscalingOptions) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !(0.0..=1.0).contains(&options.scale_down_utilization_threshold) {
        result.error(
            "scale_down_utilization_threshold",
            format!(
                "must be within [0, 1], got {}",
                options.scale_down_utilization_threshold
            ),
        );
    }

    if !(0.0..=100.0).contains(&options.max_total_unready_percentage) {
        result.error(
            "max_total_unready_percentage",
            format!(
                "must be within [0, 100], got {}",
                options.max_total_unready_percentage
            ),
        );
    }

    if options.scale_down_candidates_pool_ratio < 0.0 || options.scale_down_candidates_pool_ratio > 1.0 {
        result.error(
            "scale_down_candidates_pool_ratio",
            format!(
                "must be within [0, 1], got {}",
                options.scale_down_candidates_pool_ratio
            ),
        );
    }

    if options.initial_node_group_backoff_duration > options.max_node_group_backoff_duration {
        result.error(
            "initial_node_group_backoff_duration",
            "must not exceed max_node_group_backoff_duration",
        );
    }

    if options.scan_interval.num_seconds() < 1 {
        result.error("scan_interval", "must be at least one second");
    }

    if options.eviction_retry_time.num_milliseconds() <= 0 {
        result.error("eviction_retry_time", "must be positive");
    }

    if options.pod_gone_poll_interval.num_milliseconds() <= 0 {
        result.error("pod_gone_poll_interval", "must be positive");
    }

    if options.max_empty_bulk_delete == 0 {
        result.warning(
            "max_empty_bulk_delete",
            "empty nodes will never be deleted in bulk",
        );
    }

    if options.scale_down_unready_time < options.scale_down_unneeded_time {
        result.warning(
            "scale_down_unready_time",
            "unready nodes are removed sooner than ready ones",
        );
    }

    if options.gpu_label.is_empty() {
        result.warning("gpu_label", "accelerator limits cannot be enforced");
    }

    result
}
