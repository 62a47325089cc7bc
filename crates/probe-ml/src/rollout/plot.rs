//! Rasterised diagnostic panels shown next to rollout frames.

use anyhow::{Result, bail};
use image::{Rgb, RgbImage, imageops, imageops::FilterType};
use probe_env::Frame;

/// Side length of every panel in a diagnostic video frame.
pub const DIAGNOSTIC_FRAME_SIZE: u32 = 512;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([0, 0, 0]);
const GRID: Rgb<u8> = Rgb([220, 220, 220]);
const CORRECT: Rgb<u8> = Rgb([0, 160, 0]);
const INCORRECT: Rgb<u8> = Rgb([210, 0, 0]);
const PROBABILITY: Rgb<u8> = Rgb([0, 0, 220]);
const MARGIN: u32 = 32;

pub fn frame_to_image(frame: &Frame) -> Result<RgbImage> {
    let Some(image) = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()) else {
        bail!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        );
    };
    Ok(image)
}

struct Canvas {
    img: RgbImage,
}

impl Canvas {
    fn new(size: u32) -> Self {
        let mut canvas = Self {
            img: RgbImage::from_pixel(size, size, BACKGROUND),
        };
        canvas.axes();
        canvas
    }

    fn plot_width(&self) -> u32 {
        self.img.width().saturating_sub(2 * MARGIN).max(1)
    }

    fn plot_height(&self) -> u32 {
        self.img.height().saturating_sub(2 * MARGIN).max(1)
    }

    /// Maps `x` in `[0, 1]` and `y` in `[0, 1]` (upwards) to pixels.
    fn to_pixel(&self, x: f32, y: f32) -> (i64, i64) {
        let px = MARGIN as f32 + x.clamp(0.0, 1.0) * self.plot_width() as f32;
        let bottom = (self.img.height() - MARGIN) as f32;
        let py = bottom - y.clamp(0.0, 1.0) * self.plot_height() as f32;
        (px.round() as i64, py.round() as i64)
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        if x >= 0 && y >= 0 && (x as u32) < self.img.width() && (y as u32) < self.img.height() {
            self.img.put_pixel(x as u32, y as u32, color);
        }
    }

    fn line(&mut self, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
        let (mut x0, mut y0) = from;
        let (x1, y1) = to;
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x0, y0, color);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn disc(&mut self, center: (i64, i64), radius: i64, color: Rgb<u8>) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put(center.0 + dx, center.1 + dy, color);
                }
            }
        }
    }

    fn axes(&mut self) {
        for tick in 1..4 {
            let y = tick as f32 / 4.0;
            let (a, b) = (self.to_pixel(0.0, y), self.to_pixel(1.0, y));
            self.line(a, b, GRID);
        }
        let origin = self.to_pixel(0.0, 0.0);
        self.line(origin, self.to_pixel(1.0, 0.0), AXIS);
        self.line(origin, self.to_pixel(0.0, 1.0), AXIS);
    }
}

/// Horizontal x position of sample `i` out of `n`.
fn x_of(i: usize, n: usize) -> f32 {
    if n <= 1 { 0.5 } else { i as f32 / (n - 1) as f32 }
}

/// One dot per scored window along the time axis, green when the prediction
/// matched the trajectory label and red otherwise.
pub fn scatter_panel(correct: &[bool], size: u32) -> RgbImage {
    let mut canvas = Canvas::new(size);
    let radius = (size / 96).max(2) as i64;
    for (i, &ok) in correct.iter().enumerate() {
        let p = canvas.to_pixel(x_of(i, correct.len()), 0.5);
        canvas.disc(p, radius, if ok { CORRECT } else { INCORRECT });
    }
    canvas.img
}

/// Predicted success probability over time on a fixed `[0, 1]` axis.
pub fn probability_panel(probabilities: &[f32], size: u32) -> RgbImage {
    let mut canvas = Canvas::new(size);
    let n = probabilities.len();
    let points: Vec<(i64, i64)> = probabilities
        .iter()
        .enumerate()
        .map(|(i, &p)| canvas.to_pixel(x_of(i, n), p))
        .collect();
    match points.as_slice() {
        [] => {}
        [only] => canvas.disc(*only, 2, PROBABILITY),
        _ => {
            for pair in points.windows(2) {
                canvas.line(pair[0], pair[1], PROBABILITY);
            }
        }
    }
    canvas.img
}

/// Resizes every panel to `size`×`size` and places them left to right.
pub fn compose_panels(panels: &[&RgbImage], size: u32) -> RgbImage {
    let mut out = RgbImage::from_pixel(size * panels.len() as u32, size, BACKGROUND);
    for (i, panel) in panels.iter().enumerate() {
        let resized = if panel.dimensions() == (size, size) {
            (*panel).clone()
        } else {
            imageops::resize(*panel, size, size, FilterType::Triangle)
        };
        imageops::replace(&mut out, &resized, (i as u32 * size) as i64, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_conversion_checks_size() -> Result<()> {
        let frame = Frame::filled(3, 2, [1, 2, 3]);
        let img = frame_to_image(&frame)?;
        assert_eq!(img.get_pixel(2, 1), &Rgb([1, 2, 3]));
        let broken = Frame {
            width: 4,
            height: 4,
            data: vec![0; 5],
        };
        assert!(frame_to_image(&broken).is_err());
        Ok(())
    }

    #[test]
    fn scatter_colors_follow_correctness() {
        let img = scatter_panel(&[true, false], 128);
        let count = |c: Rgb<u8>| img.pixels().filter(|p| **p == c).count();
        assert!(count(CORRECT) > 0);
        assert!(count(INCORRECT) > 0);
        let all_ok = scatter_panel(&[true, true, true], 128);
        assert!(!all_ok.pixels().any(|p| *p == INCORRECT));
    }

    #[test]
    fn probability_line_is_drawn() {
        let img = probability_panel(&[0.0, 1.0, 0.5], 128);
        assert!(img.pixels().any(|p| *p == PROBABILITY));
        let empty = probability_panel(&[], 128);
        assert!(!empty.pixels().any(|p| *p == PROBABILITY));
    }

    #[test]
    fn compose_resizes_and_concatenates() {
        let small = RgbImage::from_pixel(10, 20, Rgb([9, 9, 9]));
        let exact = RgbImage::from_pixel(64, 64, Rgb([7, 7, 7]));
        let out = compose_panels(&[&small, &exact], 64);
        assert_eq!(out.dimensions(), (128, 64));
        assert_eq!(out.get_pixel(10, 10), &Rgb([9, 9, 9]));
        assert_eq!(out.get_pixel(100, 10), &Rgb([7, 7, 7]));
    }
}
