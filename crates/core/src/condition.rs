//! Boolean gates attached to steps and repeat policies

use serde::{Deserialize, Serialize};

/// A condition evaluated by running its command under the configured
/// shell. Success is a zero exit; a non-empty `expected` additionally
/// requires the trimmed stdout to match it exactly. `negate` flips the
/// result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Condition {
    pub condition: String,
    pub expected: String,
    pub negate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = expected.into();
        self
    }

    #[must_use]
    pub fn has_expected(&self) -> bool {
        !self.expected.is_empty()
    }
}
