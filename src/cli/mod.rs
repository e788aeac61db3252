pub mod config;
pub mod visits;
