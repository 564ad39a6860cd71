pub mod config;
pub mod decode;
pub mod error;
pub mod extractor;
pub mod model;
pub mod preprocessing;
pub mod serialize;
pub mod service;
pub mod state;

#[cfg(test)]
mod test_support;
