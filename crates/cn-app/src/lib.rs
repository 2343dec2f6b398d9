pub mod draft;
pub mod error;
pub mod events;
pub mod generator;
pub mod job;
pub mod store;
pub mod view;

pub use cn_core::Preprocessor;
