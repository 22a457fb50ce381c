use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct InstancingConfig {
    #[serde(default = "InstancingConfig::default_enabled")]
    pub enabled: bool,
}

/// Glass detection thresholds. Tunable; no renderer depends on exact values.
#[derive(Debug, Clone, Deserialize)]
pub struct GlassConfig {
    #[serde(default = "GlassConfig::default_opacity_threshold")]
    pub opacity_threshold: f32,
    #[serde(default = "GlassConfig::default_transmission_threshold")]
    pub transmission_threshold: f32,
    #[serde(default = "GlassConfig::default_keywords")]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_fov_y_degrees")]
    pub fov_y_degrees: f32,
    #[serde(default = "CameraConfig::default_offset_multiplier")]
    pub offset_multiplier: f32,
    #[serde(default = "CameraConfig::default_ortho_distance_factor")]
    pub ortho_distance_factor: f32,
    #[serde(default = "CameraConfig::default_auto_rotate_speed")]
    pub auto_rotate_speed: f32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub instancing: InstancingConfig,
    #[serde(default)]
    pub glass: GlassConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfigOverrides {
    pub instancing_enabled: Option<bool>,
    pub glass_opacity_threshold: Option<f32>,
    pub fov_y_degrees: Option<f32>,
}

impl InstancingConfig {
    const fn default_enabled() -> bool {
        true
    }
}

impl Default for InstancingConfig {
    fn default() -> Self {
        Self { enabled: Self::default_enabled() }
    }
}

impl GlassConfig {
    const fn default_opacity_threshold() -> f32 {
        0.5
    }

    const fn default_transmission_threshold() -> f32 {
        0.0
    }

    fn default_keywords() -> Vec<String> {
        vec!["glass".to_string()]
    }
}

impl Default for GlassConfig {
    fn default() -> Self {
        Self {
            opacity_threshold: Self::default_opacity_threshold(),
            transmission_threshold: Self::default_transmission_threshold(),
            keywords: Self::default_keywords(),
        }
    }
}

impl CameraConfig {
    const fn default_fov_y_degrees() -> f32 {
        45.0
    }

    const fn default_offset_multiplier() -> f32 {
        1.5
    }

    const fn default_ortho_distance_factor() -> f32 {
        2.0
    }

    const fn default_auto_rotate_speed() -> f32 {
        0.5
    }

    pub fn fov_y_radians(&self) -> f32 {
        self.fov_y_degrees.to_radians()
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: Self::default_fov_y_degrees(),
            offset_multiplier: Self::default_offset_multiplier(),
            ortho_distance_factor: Self::default_ortho_distance_factor(),
            auto_rotate_speed: Self::default_auto_rotate_speed(),
        }
    }
}

impl CacheConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &CacheConfigOverrides) {
        if let Some(enabled) = overrides.instancing_enabled {
            self.instancing.enabled = enabled;
        }
        if let Some(threshold) = overrides.glass_opacity_threshold {
            self.glass.opacity_threshold = threshold;
        }
        if let Some(fov) = overrides.fov_y_degrees {
            self.camera.fov_y_degrees = fov;
        }
    }
}

impl CacheConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.instancing_enabled.is_none()
            && self.glass_opacity_threshold.is_none()
            && self.fov_y_degrees.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.instancing_enabled.is_some() {
            fields.push("instancing.enabled");
        }
        if self.glass_opacity_threshold.is_some() {
            fields.push("glass.opacity_threshold");
        }
        if self.fov_y_degrees.is_some() {
            fields.push("camera.fov_y_degrees");
        }
        fields
    }
}
