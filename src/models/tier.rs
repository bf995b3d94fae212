//! Capability tier selected for agent invocations.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Named capability profile, mapped to a concrete model by configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    /// Quick, inexpensive answers.
    Fast,
    /// Everyday work.
    Balanced,
    /// Hard problems. The default.
    #[default]
    Deep,
}

impl CapabilityTier {
    /// All tiers in ascending capability order.
    pub const ALL: [Self; 3] = [Self::Fast, Self::Balanced, Self::Deep];

    /// Lower-case identifier used in commands and config.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Deep => "deep",
        }
    }

    /// Operator-facing label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Fast => "\u{26a1} Fast",
            Self::Balanced => "\u{2696}\u{fe0f} Balanced",
            Self::Deep => "\u{1f9e0} Deep",
        }
    }
}

impl Display for CapabilityTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityTier {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "deep" => Ok(Self::Deep),
            other => Err(AppError::Validation(format!("unknown tier: {other}"))),
        }
    }
}
