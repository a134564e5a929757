pub mod controller;
pub(crate) mod driver;
pub mod types;
