// Library for the binaries and integration tests

pub mod aggregate;
pub mod config;
pub mod crawler;
pub mod models;
pub mod report;
pub mod runner;
pub mod timecheck;
pub mod traffic_repo;
pub mod version;
