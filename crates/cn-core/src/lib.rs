mod preprocessor;

pub use preprocessor::{ParsePreprocessorError, Preprocessor};
