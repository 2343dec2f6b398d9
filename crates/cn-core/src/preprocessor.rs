use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conditioning preprocessor applied to the input image before generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preprocessor {
    #[default]
    Canny,
    Pose,
    Depth,
}

impl Preprocessor {
    /// Name for display
    pub fn name(&self) -> &str {
        match self {
            Self::Canny => "Canny Edge",
            Self::Pose => "Pose",
            Self::Depth => "Depth",
        }
    }

    /// Preprocessor ID for API communication
    pub fn id(&self) -> &'static str {
        match self {
            Self::Canny => "canny",
            Self::Pose => "pose",
            Self::Depth => "depth",
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        match self {
            Self::Canny => "Follows the outlines and edges of the input image",
            Self::Pose => "Keeps the body pose detected in the input image",
            Self::Depth => "Preserves the spatial depth layout of the input image",
        }
    }

    /// All available preprocessors
    pub fn all() -> [Preprocessor; 3] {
        [Self::Canny, Self::Pose, Self::Depth]
    }
}

impl fmt::Display for Preprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown preprocessor '{0}' (expected one of: canny, pose, depth)")]
pub struct ParsePreprocessorError(pub String);

impl FromStr for Preprocessor {
    type Err = ParsePreprocessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::all()
            .into_iter()
            .find(|p| p.id().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ParsePreprocessorError(s.to_string()))
    }
}
