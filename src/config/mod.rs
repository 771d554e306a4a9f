pub mod options;
pub mod validation;

pub use options::{AutoscalingOptions, ExpanderStrategy, DEFAULT_GPU_LABEL};
pub use validation::{validate_options, ValidationMessage, ValidationResult, ValidationSeverity};

use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// Errors while loading options
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse options: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid option {field}: {message}")]
    Invalid { field: String, message: String },
}

// ============================================================================
// I/O wrapper - thin layer over parsing and validation
// ============================================================================

/// Parse options from YAML (or JSON, which is valid YAML) and validate them
pub fn parse_options(content: &str) -> Result<AutoscalingOptions, ConfigError> {
    let options: AutoscalingOptions = serde_yaml::from_str(content)?;
    check(options)
}

/// Load, parse and validate an options file
pub fn load_options_file(path: &Path) -> Result<AutoscalingOptions, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_options(&content)
}

/// Validate options, logging warnings and failing on the first error
pub fn check(options: AutoscalingOptions) -> Result<AutoscalingOptions, ConfigError> {
    let result = validate_options(&options);
    for warning in result.warnings() {
        warn!("Option {}: {}", warning.field, warning.message);
    }
    if let Some(error) = result.errors().next() {
        return Err(ConfigError::Invalid {
            field: error.field.clone(),
            message: error.message.clone(),
        });
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_options_file() {
        let file = create_temp_file("scale_down_enabled: false\nmax_nodes_total: 20\n");
        let options = load_options_file(file.path()).unwrap();
        assert!(!options.scale_down_enabled);
        assert_eq!(options.max_nodes_total, 20);
    }

    #[test]
    fn test_load_json_options() {
        let file = create_temp_file(r#"{"ok_total_unready_count": 5}"#);
        let options = load_options_file(file.path()).unwrap();
        assert_eq!(options.ok_total_unready_count, 5);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_options_file(Path::new("/nonexistent/options.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = parse_options("scale_down_utilization_threshold: 2.0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = parse_options("scan_interval: [1, 2]\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
