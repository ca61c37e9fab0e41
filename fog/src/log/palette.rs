//! Pleasant, high-contrast terminal colors for log stream prefixes.
//!
//! Colors are picked in HSV space with saturation and value held in a band
//! that reads well on both dark and light terminals.

// Channel math stays within 0.0..=255.0 before the cast.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use colored::Color;
use rand::Rng;

/// Returns one random color from the happy band.
///
/// Used for a stream's first color, before the mux redistributes the
/// palette over every registered stream.
pub fn happy_color() -> Color {
    let mut rng = rand::rng();
    hsv(
        rng.random_range(0.0..360.0),
        rng.random_range(0.7..1.0),
        rng.random_range(0.6..0.9),
    )
}

/// Returns `n` colors with hues spread evenly around the color wheel.
///
/// Hue `i` is `i * 360 / n`, so the palette for a given `n` always walks the
/// wheel in the same order.
pub fn happy_palette(n: usize) -> Vec<Color> {
    let mut rng = rand::rng();
    #[allow(clippy::cast_precision_loss)]
    let step = 360.0 / n.max(1) as f64;
    (0..n)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let hue = i as f64 * step;
            hsv(
                hue,
                rng.random_range(0.8..1.0),
                rng.random_range(0.65..0.85),
            )
        })
        .collect()
}

/// Converts HSV (`h` in degrees, `s`/`v` in `0..=1`) to a true-color value.
fn hsv(h: f64, s: f64, v: f64) -> Color {
    let c = v * s;
    let hp = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    let channel = |f: f64| ((f + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Color::TrueColor {
        r: channel(r),
        g: channel(g),
        b: channel(b),
    }
}
