//! `jobq` command-line front end and web dashboard.

pub mod cli;
pub mod commands;
pub mod dashboard;
pub mod paths;
