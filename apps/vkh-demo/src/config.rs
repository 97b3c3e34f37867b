//! Demo configuration.

use std::path::PathBuf;
use vkh_platform::PlatformConfig;

/// Number of textures bound as one sampled-image array.
pub const TEXTURE_ARRAY_SIZE: u32 = 8;

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Frames each texture stays on screen.
    pub frames_per_image: u32,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Read uploaded geometry back and compare it before drawing.
    pub verify_uploads: bool,
    /// Directory holding `0.png` .. `7.png`. Missing files are generated.
    pub texture_dir: PathBuf,
    /// Directory holding `vanilla_vertex.spv` and `texture_array.spv`.
    pub shader_dir: PathBuf,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            title: "Texture Array Demo".to_string(),
            width: 800,
            height: 600,
            frames_per_image: 60,
            validation: cfg!(debug_assertions),
            verify_uploads: false,
            texture_dir: PathBuf::from("textures"),
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

impl DemoConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frames_per_image(mut self, frames: u32) -> Self {
        self.frames_per_image = frames.max(1);
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_verify_uploads(mut self, verify: bool) -> Self {
        self.verify_uploads = verify;
        self
    }

    pub fn with_texture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.texture_dir = dir.into();
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Apply command line options on top of the defaults. Unknown or
    /// malformed options are ignored.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--textures" => {
                    if let Some(dir) = args.next() {
                        config = config.with_texture_dir(dir);
                    }
                }
                "--shaders" => {
                    if let Some(dir) = args.next() {
                        config = config.with_shader_dir(dir);
                    }
                }
                "--frames-per-image" => {
                    if let Some(frames) = args.next().and_then(|v| v.parse().ok()) {
                        config = config.with_frames_per_image(frames);
                    }
                }
                "--size" => {
                    if let Some((w, h)) = args.next().as_deref().and_then(parse_size) {
                        config = config.with_size(w, h);
                    }
                }
                "--validation" => config = config.with_validation(true),
                "--no-validation" => config = config.with_validation(false),
                "--verify-uploads" => config = config.with_verify_uploads(true),
                _ => {}
            }
        }

        config
    }

    pub fn platform(&self) -> PlatformConfig {
        PlatformConfig::new(&self.title).with_size(self.width, self.height)
    }
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_options() {
        let config = DemoConfig::from_args(args(&[
            "--textures",
            "assets/tex",
            "--frames-per-image",
            "30",
            "--size",
            "1024x768",
            "--no-validation",
            "--verify-uploads",
        ]));
        assert_eq!(config.texture_dir, PathBuf::from("assets/tex"));
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
        assert_eq!(config.frames_per_image, 30);
        assert_eq!((config.width, config.height), (1024, 768));
        assert!(!config.validation);
        assert!(config.verify_uploads);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = DemoConfig::from_args(args(&["--size", "big", "--frames-per-image", "-3", "--bogus"]));
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.frames_per_image, 60);
    }

    #[test]
    fn frames_per_image_is_at_least_one() {
        assert_eq!(DemoConfig::default().with_frames_per_image(0).frames_per_image, 1);
    }

    #[test]
    fn platform_config_follows_demo_size() {
        let platform = DemoConfig::default().with_size(320, 200).platform();
        assert_eq!((platform.width, platform.height), (320, 200));
        assert_eq!(platform.title, "Texture Array Demo");
    }
}
