pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod order;
pub mod processor;
pub mod queue;
pub mod rest;
pub mod session;
pub mod signing;
pub mod stream;
pub mod supervisor;
pub mod tracker;
