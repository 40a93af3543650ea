pub mod cli;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod exporter;
