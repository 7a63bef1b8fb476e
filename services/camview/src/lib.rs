//! CamView
//!
//! Publishes images uploaded by remote cameras as a browsable web archive.
//! Cameras drop raw JPEGs into a per-date, per-camera incoming tree; once a
//! file has stopped changing it is promoted into full-resolution,
//! medium-resolution, thumbnail and detail-page artifacts in web storage
//! (local directory or S3-compatible bucket). Dates past the retention window
//! are purged from both trees, and per-minute throughput and latency
//! statistics are kept for every camera.
//!
//! ## Architecture
//!
//! ```text
//! incoming/<date>/<camera>/*.jpg
//!        │
//!        ▼
//! ┌──────────────┐   ready    ┌──────────────┐  move_to_web  ┌──────────────┐
//! │ Scanner      │──────────▶│ Promotion    │─────────────▶│ WebStorage   │
//! └──────────────┘            │ Pipeline     │               │ local / S3   │
//!        ▲                    └──────────────┘               └──────────────┘
//!        │                           │ events                       ▲
//! ┌──────────────┐                   ▼                              │
//! │ Orchestrator │──────────▶┌──────────────┐                ┌──────────────┐
//! │ main cycle   │  signal    │ Stats        │                │ Purge        │
//! │ today loop   │            │ Engine       │                │ Manager      │
//! └──────────────┘            └──────────────┘                └──────────────┘
//!        │                           │
//!        └──────────── purge ────────┼──────────────────────────────▶
//!                                    ▼
//!                          stats/<date>_<camera>.csv
//! ```

pub mod camera;
pub mod claims;
pub mod clock;
pub mod codec;
pub mod config;
pub mod orchestrator;
pub mod pages;
pub mod pipeline;
pub mod purge;
pub mod scanner;
pub mod stats;
pub mod storage;
pub mod waiter;

pub use camera::{Camera, CropRegion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{DerivativeCodec, ImageCodec};
pub use config::Config;
pub use orchestrator::{CycleReport, Orchestrator, OrchestratorSettings, RunSummary};
pub use pipeline::{PromoteOutcome, PromotionPipeline};
pub use purge::PurgeManager;
pub use scanner::Scanner;
pub use stats::{DateCameraKey, StatsEngine};
pub use storage::{BackendKind, StorageError, WebStorage};
pub use waiter::{IntervalWaiter, Waiter};
