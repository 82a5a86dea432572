//! Software blur for surfaces without a blur filter.
//!
//! Two box passes compose into a triangular kernel, which is the shape a
//! stack blur approximates. Only the colour channels are touched.

use image::RgbaImage;

/// Blur the RGB channels of `image` in place with the given radius.
pub fn stack_blur_rgb(image: &mut RgbaImage, radius: u32) {
    let (width, height) = image.dimensions();
    if radius == 0 || width == 0 || height == 0 {
        return;
    }

    let (width, height) = (width as usize, height as usize);
    let pass_radius = radius.div_ceil(2) as usize;

    let buffer: &mut [u8] = image;
    let mut scratch = buffer.to_vec();
    for _ in 0..2 {
        box_pass(buffer, &mut scratch, width, height, pass_radius, Axis::Horizontal);
        box_pass(&scratch, buffer, width, height, pass_radius, Axis::Vertical);
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

/// One running-sum box blur along `axis`, clamping at the edges.
fn box_pass(src: &[u8], dst: &mut [u8], width: usize, height: usize, radius: usize, axis: Axis) {
    let (lines, length, step, line_step) = match axis {
        Axis::Horizontal => (height, width, 4, width * 4),
        Axis::Vertical => (width, height, width * 4, 4),
    };
    let window = (2 * radius + 1) as u32;
    let last = length as isize - 1;

    for line in 0..lines {
        let base = line * line_step;
        for channel in 0..3 {
            let sample = |i: isize| src[base + i.clamp(0, last) as usize * step + channel] as u32;

            let mut sum: u32 = (-(radius as isize)..=radius as isize).map(sample).sum();
            for i in 0..length {
                dst[base + i * step + channel] = ((sum + window / 2) / window) as u8;
                sum += sample(i as isize + radius as isize + 1);
                sum -= sample(i as isize - radius as isize);
            }
        }
        for i in 0..length {
            let alpha = base + i * step + 3;
            dst[alpha] = src[alpha];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn uniform_image_is_unchanged() {
        let mut image = RgbaImage::from_pixel(16, 9, Rgba([40, 120, 200, 255]));
        stack_blur_rgb(&mut image, 10);
        assert!(image.pixels().all(|p| *p == Rgba([40, 120, 200, 255])));
    }

    #[test]
    fn spreads_a_single_bright_pixel() {
        let mut image = RgbaImage::from_pixel(9, 9, Rgba([0, 0, 0, 255]));
        image.put_pixel(4, 4, Rgba([255, 255, 255, 255]));
        stack_blur_rgb(&mut image, 4);

        let centre = image.get_pixel(4, 4)[0];
        let neighbour = image.get_pixel(5, 4)[0];
        let corner = image.get_pixel(0, 0)[0];
        assert!(centre < 255);
        assert!(neighbour > 0);
        assert!(centre >= neighbour);
        assert!(neighbour >= corner);
    }

    #[test]
    fn alpha_is_preserved() {
        let mut image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 128]));
        image.put_pixel(0, 0, Rgba([250, 250, 250, 7]));
        stack_blur_rgb(&mut image, 3);
        assert_eq!(image.get_pixel(0, 0)[3], 7);
        assert_eq!(image.get_pixel(3, 3)[3], 128);
    }

    #[test]
    fn zero_radius_is_a_no_op() {
        let mut image = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        image.put_pixel(1, 1, Rgba([200, 200, 200, 4]));
        let before = image.clone();
        stack_blur_rgb(&mut image, 0);
        assert_eq!(image, before);
    }
}
