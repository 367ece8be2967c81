// Core infrastructure modules
pub mod config;
pub mod core;
pub mod runner;
pub mod storage;

// Feature-specific modules
pub mod repl;
pub mod results_grid;
pub mod statements;

#[doc(hidden)]
pub mod test_utils;
