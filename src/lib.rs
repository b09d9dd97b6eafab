// src/lib.rs
pub mod ports {
    pub mod paper_dex;
}
pub mod config;
pub mod deltaneutral;
pub mod feed;
pub mod gateway;
pub mod pairs;
pub mod schedule;
pub mod strategy;
pub mod trade;
