//! Built-in stages. The image work itself is delegated to the
//! [`TargetDetector`] and [`PoseSolver`] capabilities.

use pose_wire::Transform3d;
use serde::{Deserialize, Serialize};

use crate::camera::calibration::CalibrationCoefficients;
use crate::camera::types::Frame;
use crate::pipeline::error::StageError;
use crate::pipeline::stage::PipeStage;
use crate::pipeline::target::{Detections, FrameInput, RawTarget, TargetList, TrackedTarget};

/// Image operation producing target candidates from a frame.
pub trait TargetDetector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame) -> Result<Vec<RawTarget>, StageError>;
}

/// Solves a target's 3D pose from its image points and the intrinsics.
pub trait PoseSolver: Send + Sync + 'static {
    fn solve(
        &self,
        target: &RawTarget,
        calibration: &CalibrationCoefficients,
    ) -> Option<Transform3d>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectParams {
    /// Minimum target area as a percentage of the image.
    pub min_area: f64,
    pub max_targets: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            min_area: 0.0,
            max_targets: 5,
        }
    }
}

/// Runs the detector, then filters and orders its candidates by area.
pub struct DetectStage<D> {
    detector: D,
}

impl<D: TargetDetector> DetectStage<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }
}

impl<D: TargetDetector> PipeStage for DetectStage<D> {
    type Input = FrameInput;
    type Output = Detections;
    type Params = DetectParams;

    fn process(&self, input: FrameInput, params: &DetectParams) -> Result<Detections, StageError> {
        let image_area = input.frame.props.image_area;
        let mut targets: Vec<RawTarget> = self
            .detector
            .detect(&input.frame)?
            .into_iter()
            .filter(|t| image_area > 0.0 && t.area_px / image_area * 100.0 >= params.min_area)
            .collect();
        targets.sort_by(|a, b| b.area_px.total_cmp(&a.area_px));
        targets.truncate(params.max_targets);
        Ok(Detections { input, targets })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetParams {
    pub solve_pose: bool,
}

impl Default for TargetParams {
    fn default() -> Self {
        Self { solve_pose: true }
    }
}

/// Converts pixel candidates into angles and, when calibrated, poses.
///
/// Without calibration for the frame's exact resolution the targets keep
/// their angles, carry no pose and are flagged uncalibrated.
pub struct TargetStage<P> {
    solver: P,
}

impl<P: PoseSolver> TargetStage<P> {
    pub fn new(solver: P) -> Self {
        Self { solver }
    }
}

impl<P: PoseSolver> PipeStage for TargetStage<P> {
    type Input = Detections;
    type Output = TargetList;
    type Params = TargetParams;

    fn process(&self, input: Detections, params: &TargetParams) -> Result<TargetList, StageError> {
        let frame = &input.input.frame;
        let props = &frame.props;
        let calibration = input
            .input
            .calibration
            .as_deref()
            .filter(|c| c.resolution == props.resolution);

        let targets = input
            .targets
            .iter()
            .map(|t| TrackedTarget {
                yaw: ((t.center_x - props.center_x) / props.horizontal_focal_length)
                    .atan()
                    .to_degrees(),
                pitch: -((t.center_y - props.center_y) / props.vertical_focal_length)
                    .atan()
                    .to_degrees(),
                area: if props.image_area > 0.0 {
                    t.area_px / props.image_area * 100.0
                } else {
                    0.0
                },
                center_x: t.center_x,
                center_y: t.center_y,
                pose: calibration
                    .filter(|_| params.solve_pose)
                    .and_then(|c| self.solver.solve(t, c)),
                calibrated: calibration.is_some(),
            })
            .collect();

        Ok(TargetList {
            timestamp_nanos: frame.timestamp_nanos,
            resolution: props.resolution,
            targets,
            uncalibrated: params.solve_pose && calibration.is_none(),
        })
    }
}

/// Driver-camera pipeline stage: no processing, no targets.
pub struct DriverModeStage;

impl PipeStage for DriverModeStage {
    type Input = FrameInput;
    type Output = TargetList;
    type Params = ();

    fn process(&self, input: FrameInput, _params: &()) -> Result<TargetList, StageError> {
        Ok(TargetList {
            timestamp_nanos: input.frame.timestamp_nanos,
            resolution: input.frame.props.resolution,
            targets: Vec::new(),
            uncalibrated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::{FrameImage, FrameStaticProperties, Resolution};
    use crate::pipeline::compose::Pipeline;
    use pose_wire::{Quaternion, Translation3d};
    use std::sync::Arc;

    struct FixedDetector(Vec<RawTarget>);

    impl TargetDetector for FixedDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<RawTarget>, StageError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl TargetDetector for BrokenDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<RawTarget>, StageError> {
            Err("contour buffer overflow".into())
        }
    }

    struct UnitSolver;

    impl PoseSolver for UnitSolver {
        fn solve(&self, target: &RawTarget, _c: &CalibrationCoefficients) -> Option<Transform3d> {
            Some(Transform3d::new(
                Translation3d {
                    x: target.center_x,
                    y: target.center_y,
                    z: 1.0,
                },
                Quaternion::IDENTITY,
            ))
        }
    }

    fn raw(x: f64, y: f64, area: f64) -> RawTarget {
        RawTarget {
            center_x: x,
            center_y: y,
            area_px: area,
            corners: Vec::new(),
        }
    }

    fn input(calibration: Option<CalibrationCoefficients>) -> FrameInput {
        let resolution = Resolution::new(100, 100);
        let props = Arc::new(FrameStaticProperties::new(
            resolution,
            90.0,
            calibration.as_ref(),
        ));
        FrameInput {
            frame: Frame::new(
                FrameImage {
                    data: vec![0; 100 * 100],
                    width: 100,
                    height: 100,
                    channels: 1,
                },
                1_000,
                props,
            ),
            calibration: calibration.map(Arc::new),
        }
    }

    fn calibration_for(width: u32, height: u32) -> CalibrationCoefficients {
        CalibrationCoefficients::new(
            Resolution::new(width, height),
            [[50.0, 0.0, 50.0], [0.0, 50.0, 50.0], [0.0, 0.0, 1.0]],
            vec![0.0; 5],
            vec![0.1],
        )
    }

    fn pipeline(detector: impl TargetDetector) -> Pipeline<FrameInput, TargetList> {
        Pipeline::builder("targets")
            .then("detect", DetectStage::new(detector))
            .then("targets", TargetStage::new(UnitSolver))
            .build()
    }

    #[test]
    fn detect_filters_sorts_and_truncates() {
        let stage = DetectStage::new(FixedDetector(vec![
            raw(10.0, 10.0, 5.0),
            raw(20.0, 20.0, 300.0),
            raw(30.0, 30.0, 150.0),
            raw(40.0, 40.0, 200.0),
        ]));
        let params = DetectParams {
            min_area: 1.0,
            max_targets: 2,
        };
        let out = stage.process(input(None), &params).unwrap();
        let areas: Vec<f64> = out.targets.iter().map(|t| t.area_px).collect();
        assert_eq!(areas, vec![300.0, 200.0]);
    }

    #[test]
    fn centred_target_has_zero_angles() {
        let stage = TargetStage::new(UnitSolver);
        let mut detections = DetectStage::new(FixedDetector(vec![]))
            .process(input(None), &DetectParams::default())
            .unwrap();
        detections.targets = vec![raw(49.5, 49.5, 100.0)];

        let out = stage.process(detections, &TargetParams::default()).unwrap();
        assert!(out.targets[0].yaw.abs() < 1e-9);
        assert!(out.targets[0].pitch.abs() < 1e-9);
        assert_eq!(out.targets[0].area, 1.0);
    }

    #[test]
    fn target_right_of_centre_has_positive_yaw_and_above_has_positive_pitch() {
        let out = pipeline(FixedDetector(vec![raw(90.0, 10.0, 50.0)]))
            .run(input(None))
            .unwrap()
            .output;
        assert!(out.targets[0].yaw > 0.0);
        assert!(out.targets[0].pitch > 0.0);
    }

    #[test]
    fn missing_calibration_flags_uncalibrated_without_pose() {
        let out = pipeline(FixedDetector(vec![raw(50.0, 50.0, 50.0)]))
            .run(input(None))
            .unwrap()
            .output;
        assert!(out.uncalibrated);
        assert!(out.targets[0].pose.is_none());
        assert!(!out.targets[0].calibrated);
    }

    #[test]
    fn calibration_for_other_resolution_is_not_used() {
        let mut frame_input = input(None);
        frame_input.calibration = Some(Arc::new(calibration_for(200, 200)));
        let out = pipeline(FixedDetector(vec![raw(50.0, 50.0, 50.0)]))
            .run(frame_input)
            .unwrap()
            .output;
        assert!(out.uncalibrated);
        assert!(out.targets[0].pose.is_none());
    }

    #[test]
    fn matching_calibration_solves_pose() {
        let out = pipeline(FixedDetector(vec![raw(60.0, 40.0, 50.0)]))
            .run(input(Some(calibration_for(100, 100))))
            .unwrap()
            .output;
        assert!(!out.uncalibrated);
        let pose = out.targets[0].pose.unwrap();
        assert_eq!(pose.translation.x, 60.0);
        assert!(out.targets[0].calibrated);
    }

    #[test]
    fn pose_solving_can_be_disabled() {
        let p = pipeline(FixedDetector(vec![raw(60.0, 40.0, 50.0)]));
        p.set_params("targets", TargetParams { solve_pose: false })
            .unwrap();
        let out = p.run(input(None)).unwrap().output;
        assert!(!out.uncalibrated);
        assert!(out.targets[0].pose.is_none());
    }

    #[test]
    fn detector_error_surfaces_as_stage_failure() {
        let err = pipeline(BrokenDetector).run(input(None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage 'detect' failed: contour buffer overflow"
        );
    }

    #[test]
    fn driver_mode_reports_no_targets() {
        let p = Pipeline::builder("driver")
            .then("driver", DriverModeStage)
            .build();
        let out = p.run(input(None)).unwrap().output;
        assert!(!out.has_targets());
        assert!(out.best().is_none());
        assert_eq!(out.timestamp_nanos, 1_000);
    }

    #[test]
    fn detect_params_deserialise_with_defaults() {
        let params: DetectParams = serde_json::from_value(serde_json::json!({
            "minArea": 2.5
        }))
        .unwrap();
        assert_eq!(params.min_area, 2.5);
        assert_eq!(params.max_targets, 5);
    }
}
