pub(crate) mod engine;
pub mod manager;
pub(crate) mod types;
