//! axe-previewd: concurrent SwiftUI preview orchestrator
//!
//! Drives live previews on iOS simulators for many editor-opened files at
//! once, communicating with the editor over a stdin/stdout line-delimited
//! JSON protocol (`wire`). Each stream (`stream`) owns one simulator
//! acquired from a shared pool (`device_pool`), builds and hot-reloads a
//! generated preview thunk (`parser`, `reload_deploy`) under a shared
//! inter-process build lock (`buildlock`), and relays the simulator's video
//! and HID surfaces (`video`, `hid`) through a companion process
//! (`companion`).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │   editor (stdin/stdout)│
//! └───────────┬────────────┘
//!             │ wire::Command / wire::Event
//!             ▼
//! ┌────────────────────────────────────────────┐
//! │              StreamManager (manager)        │
//! │                                              │
//! │  ┌────────┐  ┌────────┐  ┌────────────────┐│
//! │  │ Stream │  │ Stream │  │ DevicePool     ││
//! │  │(stream)│  │(stream)│  │ (device_pool)  ││
//! │  └───┬────┘  └───┬────┘  └────────┬───────┘│
//! │      │  companion / video / hid    │        │
//! │      └──────────────┬──────────────┘        │
//! │                     ▼                        │
//! │            BuildLock (buildlock)              │
//! └────────────────────────────────────────────┘
//! ```

pub mod buildlock;
pub mod classify;
pub mod companion;
pub mod config;
pub mod device_pool;
pub mod error;
pub mod hid;
pub mod manager;
pub mod parser;
pub mod production;
pub mod reload;
pub mod reload_deploy;
pub mod stream;
pub mod toolchain;
pub mod video;
pub mod watcher;
pub mod wire;

pub use manager::{StreamManager, StreamManagerHandle};
