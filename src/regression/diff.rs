//! Pixel-level comparator.
//!
//! Colour distance is measured in YIQ space so that perceptually small
//! changes stay under the per-pixel threshold. Pixels that look like
//! anti-aliasing (an edge pixel with many identical siblings in both images)
//! are painted separately and not counted as differences.

use crate::error::{RegressError, RegressResult};
use crate::regression::bitmap::Bitmap;

/// Maximum possible YIQ delta between two colours
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Options for [`compare_pixels`]
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Per-pixel colour distance threshold (0-1), smaller is stricter
    pub threshold: f64,
    /// Count anti-aliased pixels as differences
    pub include_aa: bool,
    /// Opacity of unchanged pixels in the diff image
    pub alpha: f64,
    pub aa_color: [u8; 3],
    pub diff_color: [u8; 3],
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            include_aa: false,
            alpha: 0.1,
            aa_color: [255, 255, 0],
            diff_color: [255, 0, 0],
        }
    }
}

impl DiffOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            ..Default::default()
        }
    }
}

/// Raw comparison counts
#[derive(Debug, Clone)]
pub struct PixelDiff {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    /// Visualization: faded greyscale, differences in `diff_color`
    pub image: Option<Bitmap>,
}

impl PixelDiff {
    /// Percentage of differing pixels, rounded to two decimals
    pub fn percentage(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        let raw = self.diff_pixels as f64 / self.total_pixels as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }
}

/// Compare two bitmaps pixel by pixel.
///
/// Fails with `DimensionMismatch` when the sizes differ; no pixel is examined
/// in that case.
pub fn compare_pixels(
    expected: &Bitmap,
    actual: &Bitmap,
    options: &DiffOptions,
    render_image: bool,
) -> RegressResult<PixelDiff> {
    if expected.dimensions() != actual.dimensions() {
        return Err(RegressError::DimensionMismatch {
            expected: expected.dimensions(),
            actual: actual.dimensions(),
        });
    }

    let (width, height) = expected.dimensions();
    let total_pixels = expected.pixel_count();
    let img1 = expected.as_bytes();
    let img2 = actual.as_bytes();
    let mut output = render_image.then(|| Bitmap::new(width, height));

    if img1 == img2 {
        if let Some(out) = output.as_mut() {
            for y in 0..height {
                for x in 0..width {
                    draw_gray_pixel(img1, pixel_pos(x, y, width), options.alpha, out, x, y);
                }
            }
        }
        return Ok(PixelDiff {
            diff_pixels: 0,
            total_pixels,
            image: output,
        });
    }

    let max_delta = MAX_YIQ_DELTA * options.threshold * options.threshold;
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let pos = pixel_pos(x, y, width);
            let delta = color_delta(img1, img2, pos, pos, false);

            if delta.abs() > max_delta {
                let antialiased = !options.include_aa
                    && (is_antialiased(img1, x, y, width, height, img2)
                        || is_antialiased(img2, x, y, width, height, img1));
                if antialiased {
                    if let Some(out) = output.as_mut() {
                        out.set_pixel(x, y, opaque(options.aa_color));
                    }
                } else {
                    if let Some(out) = output.as_mut() {
                        out.set_pixel(x, y, opaque(options.diff_color));
                    }
                    diff_pixels += 1;
                }
            } else if let Some(out) = output.as_mut() {
                draw_gray_pixel(img1, pos, options.alpha, out, x, y);
            }
        }
    }

    Ok(PixelDiff {
        diff_pixels,
        total_pixels,
        image: output,
    })
}

fn pixel_pos(x: u32, y: u32, width: u32) -> usize {
    ((y as usize) * (width as usize) + (x as usize)) * 4
}

fn opaque(rgb: [u8; 3]) -> [u8; 4] {
    [rgb[0], rgb[1], rgb[2], 255]
}

/// Check whether a pixel is likely part of anti-aliasing: few identical
/// neighbours, and its darkest or brightest neighbour sits in a flat region
/// in both images.
fn is_antialiased(img: &[u8], x1: u32, y1: u32, width: u32, height: u32, other: &[u8]) -> bool {
    let x0 = x1.saturating_sub(1);
    let y0 = y1.saturating_sub(1);
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);
    let pos = pixel_pos(x1, y1, width);

    let mut zeroes = u32::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    let mut min = 0.0;
    let mut max = 0.0;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (0, 0, 0, 0);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let delta = color_delta(img, img, pos, pixel_pos(x, y, width), true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_x = x;
                min_y = y;
            } else if delta > max {
                max = delta;
                max_x = x;
                max_y = y;
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_x, min_y, width, height)
        && has_many_siblings(other, min_x, min_y, width, height))
        || (has_many_siblings(img, max_x, max_y, width, height)
            && has_many_siblings(other, max_x, max_y, width, height))
}

/// More than two identical neighbours (image edges count as one)
fn has_many_siblings(img: &[u8], x1: u32, y1: u32, width: u32, height: u32) -> bool {
    let x0 = x1.saturating_sub(1);
    let y0 = y1.saturating_sub(1);
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);
    let pos = pixel_pos(x1, y1, width);

    let mut zeroes = u32::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let pos2 = pixel_pos(x, y, width);
            if img[pos..pos + 4] == img[pos2..pos2 + 4] {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

/// Squared YIQ distance, negative when the second colour is lighter.
/// With `y_only` only the brightness difference is returned.
fn color_delta(img1: &[u8], img2: &[u8], k: usize, m: usize, y_only: bool) -> f64 {
    let [mut r1, mut g1, mut b1, a1] = channels(img1, k);
    let [mut r2, mut g2, mut b2, a2] = channels(img2, m);

    if a1 == a2 && r1 == r2 && g1 == g2 && b1 == b2 {
        return 0.0;
    }

    if a1 < 255.0 {
        let a = a1 / 255.0;
        r1 = blend(r1, a);
        g1 = blend(g1, a);
        b1 = blend(b1, a);
    }
    if a2 < 255.0 {
        let a = a2 / 255.0;
        r2 = blend(r2, a);
        g2 = blend(g2, a);
        b2 = blend(b2, a);
    }

    let y1 = rgb_to_y(r1, g1, b1);
    let y2 = rgb_to_y(r2, g2, b2);
    let y = y1 - y2;

    if y_only {
        return y;
    }

    let i = rgb_to_i(r1, g1, b1) - rgb_to_i(r2, g2, b2);
    let q = rgb_to_q(r1, g1, b1) - rgb_to_q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 { -delta } else { delta }
}

fn channels(img: &[u8], pos: usize) -> [f64; 4] {
    [
        f64::from(img[pos]),
        f64::from(img[pos + 1]),
        f64::from(img[pos + 2]),
        f64::from(img[pos + 3]),
    ]
}

fn rgb_to_y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb_to_i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb_to_q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

/// Blend a channel with white by opacity `a`
fn blend(c: f64, a: f64) -> f64 {
    255.0 + (c - 255.0) * a
}

fn draw_gray_pixel(img: &[u8], pos: usize, alpha: f64, out: &mut Bitmap, x: u32, y: u32) {
    let [r, g, b, a] = channels(img, pos);
    let value = blend(rgb_to_y(r, g, b), alpha * a / 255.0).clamp(0.0, 255.0) as u8;
    out.set_pixel(x, y, [value, value, value, 255]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bitmaps_have_no_diff() {
        let mut a = Bitmap::with_color(40, 30, [20, 40, 60, 255]);
        a.draw_rect(5, 5, 10, 10, [200, 10, 10, 255]);
        let b = a.clone();

        let diff = compare_pixels(&a, &b, &DiffOptions::default(), true).unwrap();
        assert_eq!(diff.diff_pixels, 0);
        assert_eq!(diff.total_pixels, 1200);
        assert_eq!(diff.percentage(), 0.0);
        assert!(diff.image.is_some());
    }

    #[test]
    fn test_changed_block_is_counted() {
        let a = Bitmap::with_color(10, 10, [255, 255, 255, 255]);
        let mut b = a.clone();
        b.draw_rect(0, 0, 5, 5, [0, 0, 0, 255]);

        let diff = compare_pixels(&a, &b, &DiffOptions::default(), true).unwrap();
        assert_eq!(diff.diff_pixels, 25);
        assert_eq!(diff.percentage(), 25.0);

        let image = diff.image.unwrap();
        assert_eq!(image.get_pixel(2, 2), [255, 0, 0, 255]);
        // Unchanged white pixels are drawn as faded grey (still near white)
        assert!(image.get_pixel(8, 8)[0] > 200);
    }

    #[test]
    fn test_small_colour_shift_stays_under_threshold() {
        let a = Bitmap::with_color(8, 8, [100, 100, 100, 255]);
        let b = Bitmap::with_color(8, 8, [102, 101, 100, 255]);

        let diff = compare_pixels(&a, &b, &DiffOptions::default(), false).unwrap();
        assert_eq!(diff.diff_pixels, 0);
        assert!(diff.image.is_none());

        let strict = compare_pixels(&a, &b, &DiffOptions::with_threshold(0.0), false).unwrap();
        assert_eq!(strict.diff_pixels, 64);
    }

    #[test]
    fn test_dimension_mismatch_short_circuits() {
        let a = Bitmap::new(10, 10);
        let b = Bitmap::new(20, 20);
        let err = compare_pixels(&a, &b, &DiffOptions::default(), true).unwrap_err();
        assert!(matches!(
            err,
            RegressError::DimensionMismatch {
                expected: (10, 10),
                actual: (20, 20)
            }
        ));
    }

    #[test]
    fn test_percentage_rounds_to_two_decimals() {
        let diff = PixelDiff {
            diff_pixels: 1,
            total_pixels: 3,
            image: None,
        };
        assert_eq!(diff.percentage(), 33.33);
    }

    #[test]
    fn test_color_delta_sign_and_zero() {
        let dark = [0u8, 0, 0, 255];
        let light = [255u8, 255, 255, 255];
        assert_eq!(color_delta(&dark, &dark, 0, 0, false), 0.0);
        assert!(color_delta(&dark, &light, 0, 0, false) > 0.0);
        assert!(color_delta(&light, &dark, 0, 0, false) < 0.0);
        assert!(color_delta(&dark, &light, 0, 0, false) <= MAX_YIQ_DELTA);
    }

    /// Black block, white page; `aa_column` adds a grey pixel column on the edge
    fn edge(aa_column: bool) -> Bitmap {
        let mut bitmap = Bitmap::with_color(9, 9, [255, 255, 255, 255]);
        bitmap.draw_rect(0, 0, 4, 9, [0, 0, 0, 255]);
        if aa_column {
            bitmap.draw_rect(4, 0, 1, 9, [128, 128, 128, 255]);
        }
        bitmap
    }

    #[test]
    fn test_antialiased_edge_is_not_counted() {
        let sharp = edge(false);
        let smoothed = edge(true);

        let diff = compare_pixels(&sharp, &smoothed, &DiffOptions::default(), true).unwrap();
        assert_eq!(diff.diff_pixels, 0);
        let image = diff.image.unwrap();
        for y in 0..9 {
            assert_eq!(image.get_pixel(4, y), [255, 255, 0, 255]);
        }

        let options = DiffOptions {
            include_aa: true,
            ..DiffOptions::default()
        };
        let counted = compare_pixels(&sharp, &smoothed, &options, true).unwrap();
        assert_eq!(counted.diff_pixels, 9);
        assert_eq!(counted.image.unwrap().get_pixel(4, 4), [255, 0, 0, 255]);
    }

    #[test]
    fn test_antialiasing_detection_needs_flat_neighbours() {
        let sharp = edge(false);
        let smoothed = edge(true);
        // The grey pixel sits between two flat regions present in both images
        assert!(is_antialiased(smoothed.as_bytes(), 4, 4, 9, 9, sharp.as_bytes()));
        assert!(has_many_siblings(sharp.as_bytes(), 5, 3, 9, 9));
        // A white pixel with flat white neighbours is plain background
        assert!(!is_antialiased(sharp.as_bytes(), 4, 4, 9, 9, smoothed.as_bytes()));
    }
}
