pub mod config;
pub mod database;
pub mod exclude;
pub mod processing;
pub mod scanner;
pub mod terminal_colors;
pub mod tracing;
