// src/lib.rs

pub mod error;
pub mod policy;
pub mod metadata;
pub mod storage;
pub mod tree;
pub mod quota;
pub mod chunk;
pub mod credential;
pub mod callback;
pub mod ingest;
pub mod api;
pub mod app_state;
pub mod config;
