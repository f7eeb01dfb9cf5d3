// Configuration - load settings from config.toml
//
// Every section defaults independently, so a missing or partial file never
// fails startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkr".to_string(),
            width: 1920,
            height: 1080,
            fullscreen: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [119.0 / 255.0, 41.0 / 255.0, 83.0 / 255.0, 1.0],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub model: PathBuf,
    pub texture: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("assets/viking_room.obj"),
            texture: PathBuf::from("assets/viking_room.png"),
            vertex_shader: PathBuf::from("shaders/scene.vert.spv"),
            fragment_shader: PathBuf::from("shaders/scene.frag.spv"),
        }
    }
}

impl Config {
    /// Load configuration from config.toml, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// The requested present mode; FIFO for anything unrecognised.
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            other => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", other);
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 1280
            height = 720
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.title, "vkr");
        assert_eq!(config.graphics.present_mode, "fifo");
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn present_mode_strings_map_to_vulkan_enums() {
        let mut config = Config::default();

        config.graphics.present_mode = "MAILBOX".to_string();
        assert_eq!(config.present_mode(), ash::vk::PresentModeKHR::MAILBOX);

        config.graphics.present_mode = "immediate".to_string();
        assert_eq!(config.present_mode(), ash::vk::PresentModeKHR::IMMEDIATE);

        config.graphics.present_mode = "bogus".to_string();
        assert_eq!(config.present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
