//! Point and box prompts for segmentation models.

use serde::{Deserialize, Serialize};

use medsight_utils::config::DefaultPrompt;

use crate::error::AnalysisError;

/// Foreground click in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box from `(x0, y0)` to `(x1, y1)` in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxPrompt {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoxPrompt {
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Optional prompts attached to a segmentation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub points: Vec<Point>,
    pub boxes: Vec<BoxPrompt>,
}

impl Prompts {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.boxes.is_empty()
    }

    pub fn point(x: f32, y: f32) -> Self {
        Self {
            points: vec![Point::new(x, y)],
            boxes: Vec::new(),
        }
    }

    /// Reject coordinates that cannot describe a location in any image.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        for (index, point) in self.points.iter().enumerate() {
            if !(point.x.is_finite() && point.y.is_finite()) || point.x < 0.0 || point.y < 0.0 {
                return Err(AnalysisError::invalid_input(format!(
                    "point prompt {index} has invalid coordinates ({}, {})",
                    point.x, point.y
                )));
            }
        }
        for (index, b) in self.boxes.iter().enumerate() {
            let finite = [b.x0, b.y0, b.x1, b.y1].iter().all(|v| v.is_finite());
            if !finite || b.x0 < 0.0 || b.y0 < 0.0 {
                return Err(AnalysisError::invalid_input(format!(
                    "box prompt {index} has invalid coordinates"
                )));
            }
            if b.x0 > b.x1 || b.y0 > b.y1 {
                return Err(AnalysisError::invalid_input(format!(
                    "box prompt {index} must satisfy x0 <= x1 and y0 <= y1"
                )));
            }
        }
        Ok(())
    }

    /// Prompts actually sent to the model for an image of `width` x `height`.
    ///
    /// Explicit prompts are clamped into the image. Without prompts the configured default
    /// applies: a single click at the image centre, or nothing at all.
    ///
    /// The centre click as the default is pending product confirmation;
    /// [`DefaultPrompt::Unprompted`] turns it off.
    pub fn resolve(
        prompts: Option<&Prompts>,
        width: u32,
        height: u32,
        default: DefaultPrompt,
    ) -> Prompts {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        match prompts.filter(|p| !p.is_empty()) {
            Some(explicit) => Prompts {
                points: explicit
                    .points
                    .iter()
                    .map(|p| Point::new(p.x.clamp(0.0, max_x), p.y.clamp(0.0, max_y)))
                    .collect(),
                boxes: explicit
                    .boxes
                    .iter()
                    .map(|b| {
                        BoxPrompt::new(
                            b.x0.clamp(0.0, max_x),
                            b.y0.clamp(0.0, max_y),
                            b.x1.clamp(0.0, max_x),
                            b.y1.clamp(0.0, max_y),
                        )
                    })
                    .collect(),
            },
            None => match default {
                DefaultPrompt::CenterPoint => {
                    Prompts::point(width as f32 / 2.0, height as f32 / 2.0)
                }
                DefaultPrompt::Unprompted => Prompts::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_is_image_centre() {
        let resolved = Prompts::resolve(None, 200, 100, DefaultPrompt::CenterPoint);
        assert_eq!(resolved.points, vec![Point::new(100.0, 50.0)]);
        assert!(resolved.boxes.is_empty());

        let empty = Prompts::default();
        let resolved = Prompts::resolve(Some(&empty), 10, 10, DefaultPrompt::Unprompted);
        assert!(resolved.is_empty());
    }

    #[test]
    fn explicit_prompts_are_clamped() {
        let prompts = Prompts {
            points: vec![Point::new(500.0, 3.0)],
            boxes: vec![BoxPrompt::new(1.0, 2.0, 900.0, 900.0)],
        };
        let resolved = Prompts::resolve(Some(&prompts), 64, 32, DefaultPrompt::CenterPoint);
        assert_eq!(resolved.points[0], Point::new(63.0, 3.0));
        assert_eq!(resolved.boxes[0], BoxPrompt::new(1.0, 2.0, 63.0, 31.0));
    }

    #[test]
    fn validation_rejects_inverted_boxes_and_nan() {
        let inverted = Prompts {
            points: Vec::new(),
            boxes: vec![BoxPrompt::new(10.0, 0.0, 5.0, 4.0)],
        };
        assert!(matches!(
            inverted.validate(),
            Err(AnalysisError::InvalidInput(message)) if message.contains("x0 <= x1")
        ));
        assert!(Prompts::point(f32::NAN, 1.0).validate().is_err());
        assert!(Prompts::point(-1.0, 1.0).validate().is_err());
        assert!(Prompts::point(3.0, 4.0).validate().is_ok());
    }
}
