use anyhow::{ensure, Result};
use image::{imageops, GrayImage};
#[cfg(feature = "rvm")]
use image::RgbImage;
#[cfg(feature = "rvm")]
use ndarray::Array4;

/// Converts frames to model input tensors and model mattes back to masks
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGB image into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions
    /// 2. Convert to float and normalize to [0, 1]
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    #[cfg(feature = "rvm")]
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            image.clone()
        };

        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] = pixel[channel] as f32 / 255.0;
            }
        }

        Ok(tensor)
    }

    /// Resize a model matte to the frame dimensions
    ///
    /// # Arguments
    /// * `matte` - Flattened matte at model resolution
    /// * `matte_width` - Width of the matte
    /// * `matte_height` - Height of the matte
    /// * `target_width` - Desired output width
    /// * `target_height` - Desired output height
    ///
    /// Returns: Resized matte flattened in row-major order
    pub fn postprocess_matte(
        matte: &[f32],
        matte_width: u32,
        matte_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("postprocess").entered();

        ensure!(
            matte.len() == (matte_width * matte_height) as usize,
            "matte has {} values, expected {}x{}",
            matte.len(),
            matte_width,
            matte_height
        );

        if matte_width == target_width && matte_height == target_height {
            return Ok(matte.to_vec());
        }

        let resized = imageops::resize(
            &Self::matte_to_mask(matte, matte_width, matte_height)?,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        );

        Ok(resized.pixels().map(|p| p[0] as f32 / 255.0).collect())
    }

    /// Convert a matte into an 8-bit coverage mask
    pub fn matte_to_mask(matte: &[f32], width: u32, height: u32) -> Result<GrayImage> {
        ensure!(
            matte.len() == (width * height) as usize,
            "matte has {} values, expected {}x{}",
            matte.len(),
            width,
            height
        );

        Ok(GrayImage::from_fn(width, height, |x, y| {
            let value = (matte[(y * width + x) as usize] * 255.0).clamp(0.0, 255.0) as u8;
            image::Luma([value])
        }))
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matte_to_mask_scales_to_bytes() {
        let mask = Preprocessor::matte_to_mask(&[0.0, 0.5, 1.0, 2.0], 2, 2).unwrap();
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(1, 0)[0], 127);
        assert_eq!(mask.get_pixel(0, 1)[0], 255);
        assert_eq!(mask.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn matte_size_is_checked() {
        assert!(Preprocessor::matte_to_mask(&[0.0; 3], 2, 2).is_err());
        assert!(Preprocessor::postprocess_matte(&[0.0; 3], 2, 2, 4, 4).is_err());
    }

    #[test]
    fn postprocess_resizes_uniform_matte() {
        let matte = vec![1.0; 4 * 3];
        let resized = Preprocessor::postprocess_matte(&matte, 4, 3, 8, 6).unwrap();
        assert_eq!(resized.len(), 48);
        assert!(resized.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn postprocess_passes_through_matching_size() {
        let matte = vec![0.25, 0.75];
        let out = Preprocessor::postprocess_matte(&matte, 2, 1, 2, 1).unwrap();
        assert_eq!(out, matte);
    }
}
