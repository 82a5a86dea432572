//! Process-wide processor configuration.
//!
//! Built once, cloned into every processor through [`crate::Platform`], never mutated.

use std::ops::RangeInclusive;

/// Which segmentation model variant the engine should load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSelection {
    /// Square 256x256 model.
    General,
    /// Landscape 144x256 model, faster on wide camera frames.
    Landscape,
}

/// Settings handed to the segmentation engine factory.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationConfig {
    pub model_selection: ModelSelection,
    /// Base location model assets are resolved against (URL or directory).
    pub model_base: String,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            model_selection: ModelSelection::Landscape,
            model_base: "https://cdn.jsdelivr.net/npm/@mediapipe/selfie_segmentation@0.1.1675465747/"
                .to_string(),
        }
    }
}

impl SegmentationConfig {
    /// Resolve an asset file name against `model_base`.
    pub fn locate(&self, file: &str) -> String {
        format!("{}{}", self.model_base, file)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Rate at which the frame-callback strategy samples its output surface.
    pub capture_fps: u32,
    /// Accepted blur radii in pixels.
    pub blur_range: RangeInclusive<f32>,
    /// Radius used when no blur is given.
    pub default_blur: f32,
    pub segmentation: SegmentationConfig,
    /// Frames buffered between a source and its consumer.
    pub frame_queue_depth: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            capture_fps: 30,
            blur_range: 1.0..=100.0,
            default_blur: 20.0,
            segmentation: SegmentationConfig::default(),
            frame_queue_depth: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.capture_fps, 30);
        assert_eq!(config.blur_range, 1.0..=100.0);
        assert_eq!(config.default_blur, 20.0);
        assert_eq!(config.segmentation.model_selection, ModelSelection::Landscape);
    }

    #[test]
    fn locate_appends_to_base() {
        let config = SegmentationConfig {
            model_selection: ModelSelection::General,
            model_base: "/opt/models/".to_string(),
        };
        assert_eq!(config.locate("rvm.onnx"), "/opt/models/rvm.onnx");
    }
}
