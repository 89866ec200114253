//! The demo artwork: a vertical gradient with a stroked outline on top
//!
//! Drawing happens in unit coordinates scaled to the pixmap, so the picture
//! stretches with the window.

use anyhow::{Context, Result};
use tiny_skia::{
    Color, GradientStop, LinearGradient, Paint, PathBuilder, Pixmap, Point, Rect, SpreadMode,
    Stroke, Transform,
};

/// Control-point distance for a quarter circle drawn as one cubic
const KAPPA: f32 = 0.552_284_8;

pub fn paint(width: u32, height: u32) -> Result<Pixmap> {
    let mut pixmap = Pixmap::new(width, height).context("Failed to allocate pixmap")?;
    let scale = Transform::from_scale(width as f32, height as f32);

    let top = Color::from_rgba(0.9, 0.7, 0.2, 1.0).context("Invalid gradient color")?;
    let bottom = Color::from_rgba(0.7, 0.0, 0.0, 0.5).context("Invalid gradient color")?;
    let gradient = LinearGradient::new(
        Point::from_xy(0.0, 0.0),
        Point::from_xy(0.0, 1.0),
        vec![GradientStop::new(0.0, top), GradientStop::new(1.0, bottom)],
        SpreadMode::Pad,
        Transform::identity(),
    )
    .context("Failed to build gradient")?;
    let fill = Paint {
        shader: gradient,
        anti_alias: true,
        ..Default::default()
    };
    let unit = Rect::from_xywh(0.0, 0.0, 1.0, 1.0).context("Invalid fill rectangle")?;
    pixmap.fill_rect(unit, &fill, scale, None);

    // A quarter arc, a straight run, then a long curve back down
    let r = 0.1;
    let mut pb = PathBuilder::new();
    pb.move_to(0.0, 0.0);
    pb.line_to(0.2, 0.0);
    pb.cubic_to(0.2 + KAPPA * r, 0.0, 0.3, 0.1 - KAPPA * r, 0.3, 0.1);
    pb.line_to(0.5, 0.1);
    pb.cubic_to(0.5, 0.2, 0.5, 0.4, 0.2, 0.8);
    pb.close();
    let outline = pb.finish().context("Failed to build outline path")?;

    let mut ink = Paint::default();
    ink.set_color_rgba8(77, 51, 128, 255);
    ink.anti_alias = true;
    let stroke = Stroke {
        width: 0.02,
        ..Default::default()
    };
    pixmap.stroke_path(&outline, &ink, &stroke, scale.pre_translate(0.1, 0.1), None);

    Ok(pixmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_matches_requested_size() {
        let pixmap = paint(64, 48).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (64, 48));
    }

    #[test]
    fn test_gradient_fades_towards_the_bottom() {
        let pixmap = paint(32, 32).unwrap();
        let top = pixmap.pixel(31, 0).unwrap();
        let bottom = pixmap.pixel(31, 31).unwrap();
        assert!(top.alpha() > 240);
        assert!(bottom.alpha() < top.alpha());
    }

    #[test]
    fn test_zero_size_is_an_error() {
        assert!(paint(0, 10).is_err());
    }
}
