use std::sync::Arc;

use serde::Serialize;

use beacon_common::error::RenderError;

/// How a caught render fault is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Caused by something outside the component (browser extensions
    /// rewriting the DOM, injected scripts). Eligible for automatic retry.
    EnvironmentInterference,
    /// Anything else. Cleared only by a manual reset.
    Generic,
}

/// Injectable fault classifier.
pub type Classifier = Arc<dyn Fn(&RenderError) -> FaultKind + Send + Sync>;

/// Known interference signatures, matched case-insensitively against the
/// message and the stack.
const INTERFERENCE_SIGNATURES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-extension://",
    "safari-web-extension://",
    "ms-browser-extension://",
    "extension context invalidated",
    "the node to be removed is not a child of this node",
    "failed to execute 'removechild'",
    "failed to execute 'insertbefore'",
    "removechild",
    "insertbefore",
];

/// Default classifier: signature matching over message and stack.
pub fn classify_by_signature(error: &RenderError) -> FaultKind {
    let message = error.message.to_lowercase();
    let stack = error
        .stack
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    let matches = INTERFERENCE_SIGNATURES
        .iter()
        .any(|sig| message.contains(sig) || stack.contains(sig));

    if matches {
        FaultKind::EnvironmentInterference
    } else {
        FaultKind::Generic
    }
}

pub fn default_classifier() -> Classifier {
    Arc::new(classify_by_signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dom_mutation_is_interference() {
        let error = RenderError::new(
            "Failed to execute 'removeChild' on 'Node': The node to be removed is not a child of this node.",
        );
        assert_eq!(classify_by_signature(&error), FaultKind::EnvironmentInterference);
    }

    #[test]
    fn test_extension_in_stack_is_interference() {
        let error = RenderError::new("Cannot read properties of undefined")
            .with_stack("at inject (chrome-extension://abcdef/content.js:12:4)");
        assert_eq!(classify_by_signature(&error), FaultKind::EnvironmentInterference);
    }

    #[test]
    fn test_plain_error_is_generic() {
        let error = RenderError::new("notification list is empty");
        assert_eq!(classify_by_signature(&error), FaultKind::Generic);
    }
}
