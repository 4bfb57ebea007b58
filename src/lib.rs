//! # Progressive Tracer
//!
//! Scene-to-GPU synchronization and progressive accumulation for a compute-shader
//! path tracer. Scene edits are flattened into four structured buffers, uploaded
//! with a reuse-or-reallocate policy, and every rendered frame is folded into a
//! running mean that restarts whenever the scene, camera or viewport changes.
//!
//! ## Modules
//!
//! - [`util`] - Errors and small math helpers
//! - [`scene`] - Scene objects, the active-object registry and the snapshot builder
//! - [`gpu`] - Device seam, buffer slots, synchronizer, headless and wgpu backends
//! - [`accumulator`] - Image targets and the sample counter
//! - [`camera`] - Camera matrices and change detection
//! - [`render_loop`] - The per-frame driver
//! - [`settings`] - Persistent configuration
//!
//! ## Example
//!
//! ```ignore
//! use progressive_tracer::prelude::*;
//!
//! let mut tracer = RenderLoop::new(HeadlessBackend::new(), RenderSettings::default());
//! tracer.registry_mut().register(SceneObjectHandle::new(SphereLight {
//!     position: Vec3::new(0.0, 5.0, 0.0),
//!     radius: 1.0,
//!     intensity: 10.0,
//!     color: Vec3::ONE,
//! }));
//! let camera = CameraState::look_at(Vec3::new(0.0, 2.0, 10.0), Vec3::ZERO, 16.0 / 9.0);
//! for _ in 0..64 {
//!     tracer.run_frame(&FrameInput::new(320, 180, camera));
//! }
//! ```

pub mod accumulator;
pub mod camera;
pub mod gpu;
pub mod render_loop;
pub mod scene;
pub mod settings;
pub mod util;

// Interactive viewer (optional, enabled with "viewer" feature)
#[cfg(feature = "viewer")]
pub mod viewer;

pub use util::{Error, ErrorCategory, Result};

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accumulator::{AccumulationPhase, ProgressiveAccumulator};
    pub use crate::camera::{CameraState, CameraTracker};
    pub use crate::gpu::{BufferSynchronizer, GpuBackend, HeadlessBackend};
    pub use crate::render_loop::{FrameInput, FrameOutcome, RenderLoop, SkipReason};
    pub use crate::scene::{
        build_snapshot, FlatSceneBuffers, MeshMaterial, MeshObject, SceneObjectHandle, SceneRegistry,
        SphereLight, SpherePrimitive,
    };
    pub use crate::settings::{RenderSettings, SceneSettings, Settings};
    pub use crate::util::{Error, Result};
    pub use glam::{Mat4, Vec3};
}

/// Keeps the chrome trace file open until dropped.
#[must_use]
pub struct TracingGuard {
    #[cfg(feature = "tracing-chrome")]
    _chrome: Option<tracing_chrome::FlushGuard>,
}

/// Install the global subscriber: `fmt` output filtered by `PT_LOG` (default `info`),
/// plus a `trace.json` chrome trace when `PT_TRACE=1`.
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() -> TracingGuard {
    let filter = EnvFilter::try_from_env("PT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    #[cfg(feature = "tracing-chrome")]
    if std::env::var("PT_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .build();
        let subscriber = tracing_subscriber::registry().with(filter).with(fmt).with(chrome_layer);
        let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
        return TracingGuard {
            _chrome: installed.then_some(guard),
        };
    }

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt);
    let _ = tracing::subscriber::set_global_default(subscriber);
    TracingGuard {
        #[cfg(feature = "tracing-chrome")]
        _chrome: None,
    }
}
