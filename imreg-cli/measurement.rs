use crate::glyphs::{draw_text_mut, GLYPH_HEIGHT};
use crate::render::draw_thick_line_mut;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use imreg_core::{PixelPoint, RegError, RegResult};
use serde::Serialize;
use tracing::info;

pub const DEFAULT_UNIT: &str = "cm";

const LINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const POINT_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

pub fn pixel_distance(p1: PixelPoint, p2: PixelPoint) -> f64 {
    let dx = (p2.0 - p1.0) as f64;
    let dy = (p2.1 - p1.1) as f64;
    dx.hypot(dy)
}

/// One reference segment used to calibrate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferenceRecord {
    pub p1: PixelPoint,
    pub p2: PixelPoint,
    pub real_distance: f64,
    pub pixel_distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationState {
    Uncalibrated,
    /// Real-world units per pixel
    Calibrated { scale: f64 },
}

/// Converts pixel distances on one image into real-world units
#[derive(Debug, Clone)]
pub struct Calibrator {
    image: DynamicImage,
    unit: String,
    state: CalibrationState,
    references: Vec<ReferenceRecord>,
}

impl Calibrator {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            unit: DEFAULT_UNIT.to_string(),
            state: CalibrationState::Uncalibrated,
            references: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn scale(&self) -> Option<f64> {
        match self.state {
            CalibrationState::Calibrated { scale } => Some(scale),
            CalibrationState::Uncalibrated => None,
        }
    }

    /// Reference log in calibration order
    pub fn references(&self) -> &[ReferenceRecord] {
        &self.references
    }

    /// Set the scale from a segment of known length. Later calls replace the scale
    /// and extend the log.
    pub fn calibrate(&mut self, p1: PixelPoint, p2: PixelPoint, real_distance: f64) -> RegResult<f64> {
        if !real_distance.is_finite() || real_distance <= 0.0 {
            return Err(RegError::invalid(
                "real_distance",
                format!("{} must be positive and finite", real_distance),
            ));
        }
        let px = pixel_distance(p1, p2);
        if px == 0.0 {
            return Err(RegError::invalid("points", "reference points coincide"));
        }
        let scale = real_distance / px;
        self.references.push(ReferenceRecord {
            p1,
            p2,
            real_distance,
            pixel_distance: px,
        });
        self.state = CalibrationState::Calibrated { scale };
        info!(
            pixels = px,
            real = real_distance,
            scale,
            unit = %self.unit,
            "calibrated"
        );
        Ok(scale)
    }

    pub fn measure(&self, p1: PixelPoint, p2: PixelPoint) -> RegResult<f64> {
        let scale = self.scale().ok_or(RegError::NotCalibrated)?;
        Ok(pixel_distance(p1, p2) * scale)
    }

    /// Draw the measured segment and its length on an RGB copy of the image
    pub fn visualize(&self, p1: PixelPoint, p2: PixelPoint, label: &str) -> RegResult<RgbImage> {
        let distance = self.measure(p1, p2)?;
        let mut canvas = self.image.to_rgb8();

        draw_thick_line_mut(
            &mut canvas,
            (p1.0 as f32, p1.1 as f32),
            (p2.0 as f32, p2.1 as f32),
            2,
            LINE_COLOR,
        );
        draw_filled_circle_mut(&mut canvas, p1, 5, POINT_COLOR);
        draw_filled_circle_mut(&mut canvas, p2, 5, POINT_COLOR);

        let mid = ((p1.0 + p2.0) / 2, (p1.1 + p2.1) / 2);
        let text = format!("{}: {:.1} {}", label, distance, self.unit);
        // Anchor is the text baseline, as for the stroke fonts
        let scale = 2;
        draw_text_mut(&mut canvas, TEXT_COLOR, mid.0, mid.1 - (GLYPH_HEIGHT * scale) as i32, scale, &text);
        Ok(canvas)
    }
}

/// Spread of repeated measurements of the same quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UncertaintyStats {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    /// `std / |mean|` in percent
    pub relative_error: f64,
    pub min: f64,
    pub max: f64,
}

pub fn estimate_uncertainty(values: &[f64]) -> RegResult<UncertaintyStats> {
    if values.is_empty() {
        return Err(RegError::EmptyInput("measurements"));
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let relative_error = if std == 0.0 {
        0.0
    } else {
        std / mean.abs() * 100.0
    };
    Ok(UncertaintyStats {
        mean,
        std,
        relative_error,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// Completed two-point measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub p1: PixelPoint,
    pub p2: PixelPoint,
    pub pixel_distance: f64,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerState {
    AwaitingFirstPoint,
    AwaitingSecondPoint { first: PixelPoint },
}

/// Two-click measuring tool, fed one point at a time by whatever UI picks them
#[derive(Debug, Clone)]
pub struct MeasurementPicker {
    scale: f64,
    state: PickerState,
    measurements: Vec<Measurement>,
}

impl MeasurementPicker {
    pub fn new(scale: f64) -> RegResult<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(RegError::invalid("scale", format!("{} must be positive and finite", scale)));
        }
        Ok(Self {
            scale,
            state: PickerState::AwaitingFirstPoint,
            measurements: Vec::new(),
        })
    }

    pub fn from_calibrator(calibrator: &Calibrator) -> RegResult<Self> {
        Self::new(calibrator.scale().ok_or(RegError::NotCalibrated)?)
    }

    pub fn state(&self) -> PickerState {
        self.state
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Feed the next picked point. The second point of a pair completes a
    /// measurement and rearms the picker.
    pub fn submit(&mut self, point: PixelPoint) -> Option<Measurement> {
        match self.state {
            PickerState::AwaitingFirstPoint => {
                self.state = PickerState::AwaitingSecondPoint { first: point };
                None
            }
            PickerState::AwaitingSecondPoint { first } => {
                let px = pixel_distance(first, point);
                let m = Measurement {
                    p1: first,
                    p2: point,
                    pixel_distance: px,
                    distance: px * self.scale,
                };
                self.measurements.push(m);
                self.state = PickerState::AwaitingFirstPoint;
                info!(distance = m.distance, "measurement");
                Some(m)
            }
        }
    }

    /// Drop a pending first point
    pub fn reset(&mut self) {
        self.state = PickerState::AwaitingFirstPoint;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use proptest::prelude::*;

    fn calibrator() -> Calibrator {
        Calibrator::new(DynamicImage::ImageLuma8(GrayImage::from_pixel(120, 80, Luma([30]))))
    }

    #[test]
    fn test_measure_requires_calibration() {
        let cal = calibrator();
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert!(matches!(cal.measure((0, 0), (3, 4)), Err(RegError::NotCalibrated)));
        assert!(matches!(cal.visualize((0, 0), (3, 4), "x"), Err(RegError::NotCalibrated)));
        assert!(matches!(MeasurementPicker::from_calibrator(&cal), Err(RegError::NotCalibrated)));
    }

    #[test]
    fn test_calibrate_and_measure() {
        let mut cal = calibrator();
        let scale = cal.calibrate((10, 10), (10, 60), 25.0).unwrap();
        assert!((scale - 0.5).abs() < 1e-12);
        assert!((cal.measure((0, 0), (30, 40)).unwrap() - 25.0).abs() < 1e-12);

        // Recalibration replaces the scale and appends to the log
        cal.calibrate((0, 0), (10, 0), 10.0).unwrap();
        assert_eq!(cal.scale(), Some(1.0));
        assert_eq!(cal.references().len(), 2);
        assert_eq!(cal.references()[0].pixel_distance, 50.0);
    }

    #[test]
    fn test_calibration_rejects_degenerate_input() {
        let mut cal = calibrator();
        assert!(cal.calibrate((5, 5), (5, 5), 1.0).is_err());
        assert!(cal.calibrate((0, 0), (1, 0), 0.0).is_err());
        assert!(cal.calibrate((0, 0), (1, 0), f64::NAN).is_err());
        assert_eq!(cal.state(), CalibrationState::Uncalibrated);
        assert!(cal.references().is_empty());
    }

    #[test]
    fn test_visualize_draws_on_copy() {
        let mut cal = calibrator().with_unit("mm");
        cal.calibrate((10, 40), (110, 40), 50.0).unwrap();
        let vis = cal.visualize((10, 40), (110, 40), "width").unwrap();
        assert_eq!(vis.dimensions(), (120, 80));
        assert_eq!(*vis.get_pixel(10, 40), POINT_COLOR);
        assert_eq!(*vis.get_pixel(60, 40), LINE_COLOR);
        assert!(vis.pixels().any(|p| *p == TEXT_COLOR));
        // Stored image untouched
        assert!(cal.image().to_luma8().pixels().all(|p| p[0] == 30));
    }

    #[test]
    fn test_uncertainty() {
        let stats = estimate_uncertainty(&[9.0, 10.0, 11.0]).unwrap();
        assert!((stats.mean - 10.0).abs() < 1e-12);
        assert!((stats.std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((stats.relative_error - stats.std * 10.0).abs() < 1e-9);
        assert_eq!((stats.min, stats.max), (9.0, 11.0));
        assert_eq!(estimate_uncertainty(&[4.0]).unwrap().relative_error, 0.0);
        assert!(matches!(estimate_uncertainty(&[]), Err(RegError::EmptyInput(_))));
    }

    #[test]
    fn test_picker_two_phase() {
        let mut picker = MeasurementPicker::new(0.1).unwrap();
        assert_eq!(picker.submit((0, 0)), None);
        assert_eq!(picker.state(), PickerState::AwaitingSecondPoint { first: (0, 0) });
        let m = picker.submit((6, 8)).unwrap();
        assert!((m.distance - 1.0).abs() < 1e-12);
        assert_eq!(picker.state(), PickerState::AwaitingFirstPoint);

        picker.submit((1, 1));
        picker.reset();
        assert_eq!(picker.submit((2, 2)), None);
        assert!(picker.submit((2, 12)).is_some());
        assert_eq!(picker.measurements().len(), 2);
        assert!(MeasurementPicker::new(0.0).is_err());
    }

    proptest! {
        #[test]
        fn prop_calibration_round_trip(
            x1 in -500i32..500, y1 in -500i32..500,
            x2 in -500i32..500, y2 in -500i32..500,
            d in 0.001f64..1e4,
        ) {
            prop_assume!((x1, y1) != (x2, y2));
            let mut cal = calibrator();
            cal.calibrate((x1, y1), (x2, y2), d).unwrap();
            let measured = cal.measure((x1, y1), (x2, y2)).unwrap();
            prop_assert!((measured - d).abs() <= 1e-9 * d.max(1.0));
        }
    }
}
