//! Persistent settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::Result;

/// Kernel appearance parameters pushed every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub sky_brightness: f32,
    pub bounces: u32,
    /// Fixed RNG seed for jitter and per-frame seeds; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            sky_brightness: 1.0,
            bounces: 8,
            seed: None,
        }
    }
}

impl RenderSettings {
    /// Clamp into the range the kernel handles.
    pub fn sanitize(&mut self) {
        self.bounces = self.bounces.clamp(1, MAX_BOUNCES);
        self.sky_brightness = self.sky_brightness.max(0.0);
    }

    pub fn sanitized(mut self) -> Self {
        self.sanitize();
        self
    }
}

/// Parameters of the generated demo scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    pub num_spheres: u32,
    /// Sphere radius range `[min, max]`.
    pub sphere_radius: [f32; 2],
    pub placement_radius: f32,
    pub light_position: [f32; 3],
    pub light_radius: f32,
    pub light_intensity: f32,
    pub light_color: [f32; 3],
    pub ground_size: f32,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            num_spheres: 100,
            sphere_radius: [3.0, 8.0],
            placement_radius: 100.0,
            light_position: [0.0, 40.0, 0.0],
            light_radius: 3.0,
            light_intensity: 15.0,
            light_color: [1.0, 1.0, 1.0],
            ground_size: 200.0,
        }
    }
}

/// Application settings that persist between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub render: RenderSettings,
    pub scene: SceneSettings,

    // Window
    pub window_width: f32,
    pub window_height: f32,

    // Camera
    pub camera_distance: f32,
    pub camera_yaw: f32,
    pub camera_pitch: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            render: RenderSettings::default(),
            scene: SceneSettings::default(),
            window_width: 1280.0,
            window_height: 720.0,
            camera_distance: 160.0,
            camera_yaw: 45.0,
            camera_pitch: -25.0,
        }
    }
}

pub const MAX_BOUNCES: u32 = 32;

impl Settings {
    /// Get settings file path
    fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("progressive-tracer");
            std::fs::create_dir_all(&p).ok();
            p.push("settings.json");
            p
        })
    }

    /// Load settings from the user config dir, falling back to defaults
    pub fn load() -> Self {
        Self::path()
            .and_then(|p| Self::load_from(&p).ok())
            .unwrap_or_default()
    }

    /// Save settings to the user config dir (best effort)
    pub fn save(&self) {
        if let Some(path) = Self::path() {
            if let Err(err) = self.save_to(&path) {
                tracing::warn!(%err, path = %path.display(), "failed to save settings");
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&json)?;
        settings.sanitize();
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values a hand-edited file could push out of range.
    pub fn sanitize(&mut self) {
        self.render.sanitize();
        let [lo, hi] = self.scene.sphere_radius;
        let lo = lo.max(0.01);
        self.scene.sphere_radius = [lo, hi.max(lo)];
        self.scene.placement_radius = self.scene.placement_radius.max(0.0);
        self.scene.light_radius = self.scene.light_radius.max(0.01);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let mut settings = Settings::default();
        settings.render.sky_brightness = 2.5;
        settings.render.seed = Some(99);
        settings.scene.num_spheres = 12;
        settings.save_to(temp.path())?;

        let loaded = Settings::load_from(temp.path())?;
        assert_eq!(loaded, settings);
        Ok(())
    }

    #[test]
    fn test_missing_fields_use_defaults() -> Result<()> {
        let temp = NamedTempFile::new()?;
        std::fs::write(temp.path(), r#"{ "render": { "bounces": 3 } }"#)?;

        let loaded = Settings::load_from(temp.path())?;
        assert_eq!(loaded.render.bounces, 3);
        assert_eq!(loaded.render.sky_brightness, 1.0);
        assert_eq!(loaded.scene, SceneSettings::default());
        Ok(())
    }

    #[test]
    fn test_out_of_range_values_are_clamped() -> Result<()> {
        let temp = NamedTempFile::new()?;
        std::fs::write(
            temp.path(),
            r#"{ "render": { "bounces": 500, "sky_brightness": -1.0 }, "scene": { "sphere_radius": [5.0, 2.0] } }"#,
        )?;

        let loaded = Settings::load_from(temp.path())?;
        assert_eq!(loaded.render.bounces, MAX_BOUNCES);
        assert_eq!(loaded.render.sky_brightness, 0.0);
        assert_eq!(loaded.scene.sphere_radius, [5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_garbage_is_an_error() {
        let temp = NamedTempFile::new().expect("temp file");
        std::fs::write(temp.path(), "not json").expect("write");
        assert!(matches!(Settings::load_from(temp.path()), Err(crate::Error::Json(_))));
    }
}
