// SPDX-License-Identifier: CEPL-1.0
//! Renderer configuration.
//!
//! Everything the frame loop consults lives in [`RenderConfig`], which the
//! caller owns and hands to the renderer. Feature switches are [`Toggle`]s:
//! `auto` defers to the matching entry in [`LegacySettings`], `on`/`off`
//! force the feature regardless.

use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "refresh.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Tri-state feature switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "ToggleRepr")]
pub enum Toggle {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToggleRepr {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl TryFrom<ToggleRepr> for Toggle {
    type Error = String;

    fn try_from(repr: ToggleRepr) -> Result<Self, Self::Error> {
        match repr {
            ToggleRepr::Bool(true) => Ok(Toggle::On),
            ToggleRepr::Bool(false) => Ok(Toggle::Off),
            ToggleRepr::Int(n) if n < 0 => Ok(Toggle::Auto),
            ToggleRepr::Int(0) => Ok(Toggle::Off),
            ToggleRepr::Int(_) => Ok(Toggle::On),
            ToggleRepr::Str(s) => match s.to_ascii_lowercase().as_str() {
                "auto" => Ok(Toggle::Auto),
                "on" | "true" | "1" => Ok(Toggle::On),
                "off" | "false" | "0" => Ok(Toggle::Off),
                other => Err(format!("unknown toggle value `{other}` (expected auto, on or off)")),
            },
        }
    }
}

impl Toggle {
    /// Explicit settings win; `Auto` falls back to the legacy switch and
    /// then to `default` when no legacy value was configured.
    pub fn resolve(self, legacy: Option<bool>, default: bool) -> bool {
        match self {
            Toggle::On => true,
            Toggle::Off => false,
            Toggle::Auto => legacy.unwrap_or(default),
        }
    }
}

/// Legacy global switches an `auto` toggle defers to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacySettings {
    pub gl_fog: Option<bool>,
    pub gl_bloom: Option<bool>,
    pub gl_polyblend: Option<bool>,
    pub gl_waterwarp: Option<bool>,
    pub gl_dynamic: Option<bool>,
    pub gl_per_pixel_lighting: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// 0 disables vertical sync, N presents every Nth refresh.
    pub swap_interval: i32,
    pub shader_dir: PathBuf,
    pub clear_color: [f32; 4],

    pub fog: Toggle,
    pub bloom: Toggle,
    pub polyblend: Toggle,
    pub waterwarp: Toggle,
    pub dynamic_lights: Toggle,
    pub per_pixel_lighting: Toggle,
    pub legacy: LegacySettings,

    /// 0 draws camera-facing quads, anything else draws cylinders.
    pub beam_style: i32,
    /// 0 blends particles with alpha, anything else adds them.
    pub particle_style: i32,
    pub part_scale: f32,
    pub flares: bool,
    /// Translucent entities at or below this alpha draw after the effects layer.
    pub draw_order_threshold: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            swap_interval: 1,
            shader_dir: PathBuf::from("shaders"),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fog: Toggle::Auto,
            bloom: Toggle::Auto,
            polyblend: Toggle::Auto,
            waterwarp: Toggle::Auto,
            dynamic_lights: Toggle::Auto,
            per_pixel_lighting: Toggle::Auto,
            legacy: LegacySettings::default(),
            beam_style: 1,
            particle_style: 0,
            part_scale: 2.0,
            flares: true,
            draw_order_threshold: 0.5,
        }
    }
}

impl RenderConfig {
    pub fn swap_interval(&self) -> u32 {
        self.swap_interval.max(0) as u32
    }

    pub fn fog_enabled(&self) -> bool {
        self.fog.resolve(self.legacy.gl_fog, true)
    }

    pub fn bloom_enabled(&self) -> bool {
        self.bloom.resolve(self.legacy.gl_bloom, true)
    }

    pub fn polyblend_enabled(&self) -> bool {
        self.polyblend.resolve(self.legacy.gl_polyblend, true)
    }

    pub fn waterwarp_enabled(&self) -> bool {
        self.waterwarp.resolve(self.legacy.gl_waterwarp, true)
    }

    pub fn dynamic_lights_allowed(&self) -> bool {
        self.dynamic_lights.resolve(self.legacy.gl_dynamic, true)
    }

    pub fn per_pixel_lighting_allowed(&self) -> bool {
        self.per_pixel_lighting
            .resolve(self.legacy.gl_per_pixel_lighting, true)
    }

    pub fn from_toml_str(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str::<RenderConfig>(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Loads `path` (or [`DEFAULT_CONFIG_FILE`]). A missing file yields the
/// defaults; an unreadable or malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<RenderConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(path) {
        Ok(text) => {
            let cfg = RenderConfig::from_toml_str(path, &text)?;
            tracing::info!("config loaded from {}", path.display());
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{} not found, using defaults", path.display());
            Ok(RenderConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> RenderConfig {
        RenderConfig::from_toml_str(Path::new("test.toml"), text).unwrap()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse("");
        assert_eq!(cfg.swap_interval, 1);
        assert_eq!(cfg.fog, Toggle::Auto);
        assert!(cfg.flares);
        assert_eq!(cfg.draw_order_threshold, 0.5);
    }

    #[test]
    fn toggles_accept_words_bools_and_ints() {
        let cfg = parse(
            r#"
            fog = "off"
            bloom = true
            polyblend = -1
            waterwarp = 0
            dynamic_lights = "ON"
            "#,
        );
        assert_eq!(cfg.fog, Toggle::Off);
        assert_eq!(cfg.bloom, Toggle::On);
        assert_eq!(cfg.polyblend, Toggle::Auto);
        assert_eq!(cfg.waterwarp, Toggle::Off);
        assert_eq!(cfg.dynamic_lights, Toggle::On);
    }

    #[test]
    fn unknown_toggle_word_is_a_parse_error() {
        let err = RenderConfig::from_toml_str(Path::new("bad.toml"), "fog = \"sometimes\"");
        assert!(matches!(err, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn auto_defers_to_legacy_then_default() {
        assert!(Toggle::Auto.resolve(None, true));
        assert!(!Toggle::Auto.resolve(Some(false), true));
        assert!(Toggle::Auto.resolve(Some(true), false));
        assert!(Toggle::On.resolve(Some(false), false));
        assert!(!Toggle::Off.resolve(Some(true), true));

        let cfg = parse(
            r#"
            [legacy]
            gl_bloom = false
            "#,
        );
        assert!(!cfg.bloom_enabled());
        assert!(cfg.fog_enabled());
    }

    #[test]
    fn negative_swap_interval_clamps_to_zero() {
        let cfg = parse("swap_interval = -3");
        assert_eq!(cfg.swap_interval(), 0);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = load_config(Some(Path::new("definitely/not/here.toml"))).unwrap();
        assert_eq!(cfg.swap_interval(), 1);
    }
}
