//! Camera Engine - camera capture, session control and file encoding.
//!
//! This is the main library crate. It provides the capture session
//! controller, frame routing to the encoder and side consumers, and the
//! stream encoder that muxes frames into a container file.

pub mod capture;
pub mod config;
pub mod detect;
pub mod encoder;
pub mod engine;
pub mod recorder;
pub mod storage;
pub mod utils;

pub use config::{DevicePosition, EngineConfig};
pub use engine::{CameraEngine, EngineStats};
pub use utils::error::{CaptureError, CaptureResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camera_engine=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Camera Engine v{}", env!("CARGO_PKG_VERSION"));
}
