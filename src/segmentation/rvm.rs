use super::preprocess::Preprocessor;
use super::types::{Matte, SegmentationModel};
use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{Array1, Array4, Ix4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// RobustVideoMatting segmentation model
///
/// This model uses recurrent connections to maintain temporal consistency.
/// Hidden states (r1-r4) are carried between frames for smooth results.
pub struct RobustVideoMatting {
    session: Session,
    preprocessor: Preprocessor,

    // Recurrent hidden states, fed back in on the next frame
    r1: Array4<f32>,
    r2: Array4<f32>,
    r3: Array4<f32>,
    r4: Array4<f32>,

    downsample_ratio: f32,
}

impl RobustVideoMatting {
    /// Load an RVM ONNX export
    ///
    /// # Default Configuration
    /// - Input size: 512x288, matching landscape camera frames
    /// - Downsample ratio: 0.25
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading RVM model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("RVM model loaded successfully");

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(512, 288),
            r1: empty_state(),
            r2: empty_state(),
            r3: empty_state(),
            r4: empty_state(),
            downsample_ratio: 0.25,
        })
    }
}

/// RVM accepts 1x1x1x1 zero tensors as the initial recurrent state.
fn empty_state() -> Array4<f32> {
    Array4::zeros((1, 1, 1, 1))
}

impl SegmentationModel for RobustVideoMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let _span = tracing::debug_span!("rvm_segment").entered();

        let input = self.preprocessor.preprocess(frame)?;
        let ratio = Array1::from_elem(1, self.downsample_ratio);

        // src, r1i..r4i, downsample_ratio -> fgr, pha, r1o..r4o
        let outputs = self
            .session
            .run(ort::inputs![
                TensorRef::from_array_view(input.view())?,
                TensorRef::from_array_view(self.r1.view())?,
                TensorRef::from_array_view(self.r2.view())?,
                TensorRef::from_array_view(self.r3.view())?,
                TensorRef::from_array_view(self.r4.view())?,
                TensorRef::from_array_view(ratio.view())?
            ])
            .context("Failed to run inference")?;

        let pha = outputs[1].try_extract_array::<f32>()?;
        let shape = pha.shape().to_vec();
        let matte: Vec<f32> = pha.iter().copied().collect();

        let next_state = |index: usize| -> Result<Array4<f32>> {
            Ok(outputs[index]
                .try_extract_array::<f32>()?
                .to_owned()
                .into_dimensionality::<Ix4>()?)
        };
        let (r1, r2, r3, r4) = (next_state(2)?, next_state(3)?, next_state(4)?, next_state(5)?);
        drop(outputs);
        self.r1 = r1;
        self.r2 = r2;
        self.r3 = r3;
        self.r4 = r4;

        // pha is [1, 1, H, W]; callers resize it to frame size from output_size()
        let (matte_height, matte_width) = (shape[2] as u32, shape[3] as u32);
        if (matte_width, matte_height) != self.output_size() {
            return Preprocessor::postprocess_matte(
                &matte,
                matte_width,
                matte_height,
                self.input_size().0,
                self.input_size().1,
            );
        }
        Ok(matte)
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting RVM hidden states");
        self.r1 = empty_state();
        self.r2 = empty_state();
        self.r3 = empty_state();
        self.r4 = empty_state();
    }

    fn input_size(&self) -> (u32, u32) {
        self.preprocessor.target_size()
    }
}
