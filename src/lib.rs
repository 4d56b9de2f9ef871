//! imgoverlay
//!
//! Control-channel server that lets an external producer place RGBA images
//! on top of a host's rendered frames. Buffers arrive as memfd shared
//! memory or DMA-BUF planes over a Unix socket; the host pumps the server
//! once per frame and draws whatever the registry holds.

pub mod config;
pub mod error;
pub mod fd_transfer;
pub mod present;
pub mod producer;
pub mod registry;
pub mod session;
pub mod shm;

pub use config::Config;
pub use error::ControlError;
pub use present::{PresentAction, PresentTracker, drawable};
pub use producer::{Producer, SharedImage};
pub use registry::{Backing, Geometry, ImageContent, ImageDesc, ImageView, Limits, PlaneView, Registry};
pub use session::{ControlServer, Endpoint, PumpEvent, SessionState};
