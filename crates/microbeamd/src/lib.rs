//! Microbeam Daemon - run controller and network servers
//!
//! This crate provides the daemon side of the scan controller:
//! - `controller` - run state machine actor and the scan generator task
//! - `subscribers` - TCP pub/sub for lifecycle and position events
//! - `control` - JSON-lines control surface for front-ends
//! - `latch` - latch-up waveform channel
//! - `storage` - run id counter, hit log, waveform table
//! - `run_log` - per-run log file sink for `tracing`
//! - `config` - TOML configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        microbeamd                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  ControlServer  │────▶│       RunController         │    │
//! │  │  (JSON lines)   │     │ (run state owner) + scan    │    │
//! │  └─────────────────┘     └──────┬───────────────▲──────┘    │
//! │                                 │ broadcast     │ HitBatch  │
//! │                                 ▼ read_ack      │           │
//! │  ┌─────────────────┐     ┌─────────────┐  ┌─────┴───────┐   │
//! │  │SubscriberServer │────▶│SubscriberHub│  │   HitPump   │   │
//! │  │   (pub/sub)     │     └─────────────┘  │ + backend   │   │
//! │  └─────────────────┘                      └─────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod latch;
pub mod run_log;
pub mod storage;
pub mod subscribers;
