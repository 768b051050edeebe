// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测结果解码 (后处理)
// 原始输出张量 → 像素坐标的检测框 + 类别 + 置信度
//
// 注意: 整个流程不做 NMS, 同一目标的重叠框会全部保留

use ndarray::{ArrayView1, ArrayView2, ArrayView3, ArrayViewD, Ix3};

use super::types::{Bbox, ClassCatalog, Detection};
use crate::config::{DetectorConfig, OutputNames, OutputSchema};
use crate::error::{ConfigError, PostprocessError};
use crate::models::RawOutputs;

/// 检测解码器: {输出格式, 阈值, 类别表, 输出名}
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    schema: OutputSchema,
    threshold: f32,
    catalog: ClassCatalog,
    names: OutputNames,
}

impl DetectionDecoder {
    pub fn new(
        schema: OutputSchema,
        threshold: f32,
        catalog: ClassCatalog,
        names: OutputNames,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold {} is outside [0, 1]",
                threshold
            )));
        }
        catalog.validate()?;
        schema.check_output_names(&names)?;
        Ok(Self {
            schema,
            threshold,
            catalog,
            names,
        })
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.schema,
            config.threshold(),
            config.classes.clone(),
            config.output_names(),
        )
    }

    pub fn schema(&self) -> OutputSchema {
        self.schema
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    /// 需要向模型请求的输出, 按固定顺序
    pub fn output_names(&self) -> Vec<String> {
        self.names.ordered()
    }

    /// 解码
    ///
    /// # Arguments
    /// * `outputs` - 推理的原始输出
    /// * `width`, `height` - 显示图片的尺寸, 用于坐标还原
    pub fn decode(
        &self,
        outputs: &RawOutputs,
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, PostprocessError> {
        let boxes = boxes_view(outputs, &self.names.boxes)?;
        match self.schema {
            OutputSchema::MultiClassScores => self.decode_multiclass(outputs, boxes, width, height),
            OutputSchema::ArgmaxClass => self.decode_argmax(outputs, boxes, width, height),
        }
    }

    /// 每个候选框 × 每个类别独立判断, 一个框可以产生多个检测
    fn decode_multiclass(
        &self,
        outputs: &RawOutputs,
        boxes: ArrayView3<f32>,
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, PostprocessError> {
        let n = boxes.shape()[1];
        let name = &self.names.scores;
        let scores = tensor(outputs, name)?;
        let scores: ArrayView3<f32> = batch_of_one(scores, name, "[1, N, C]")?;
        check_candidates(name, n, scores.shape()[1])?;

        let columns = scores.shape()[2];
        if let Some(entry) = self.catalog.iter().find(|e| e.id >= columns) {
            return Err(PostprocessError::ClassColumn {
                label: entry.name.clone(),
                id: entry.id,
                columns,
            });
        }

        let mut ys = Vec::new();
        for i in 0..n {
            for entry in self.catalog.iter() {
                let score = scores[[0, i, entry.id]];
                if score > self.threshold {
                    check_score(i, score)?;
                    let bbox = denormalize(boxes.slice(ndarray::s![0, i, ..]), width, height);
                    ys.push(Detection::new(bbox, entry.name.clone(), score));
                }
            }
        }
        Ok(ys)
    }

    /// 每个候选框一个类别 (1-based, 0 保留)
    fn decode_argmax(
        &self,
        outputs: &RawOutputs,
        boxes: ArrayView3<f32>,
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, PostprocessError> {
        let n = boxes.shape()[1];
        let scores_name = &self.names.scores;
        let scores: ArrayView2<f32> =
            batch_of_one(tensor(outputs, scores_name)?, scores_name, "[1, N]")?;
        check_candidates(scores_name, n, scores.shape()[1])?;

        // new() 已保证 ArgmaxClass 一定有 class_ids
        let classes_name = self.names.class_ids.as_deref().unwrap_or_default();
        let classes: ArrayView2<f32> =
            batch_of_one(tensor(outputs, classes_name)?, classes_name, "[1, N]")?;
        check_candidates(classes_name, n, classes.shape()[1])?;

        let mut ys = Vec::new();
        for i in 0..n {
            let score = scores[[0, i]];
            if score <= self.threshold || score.is_nan() {
                continue;
            }
            check_score(i, score)?;

            let value = classes[[0, i]];
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
                return Err(PostprocessError::NonIntegralClass {
                    candidate: i,
                    value,
                });
            }
            let class_id = value as usize;
            let entry = class_id
                .checked_sub(1)
                .and_then(|ordinal| self.catalog.by_ordinal(ordinal))
                .ok_or(PostprocessError::ClassIndex {
                    candidate: i,
                    class_id,
                    catalog_len: self.catalog.len(),
                })?;

            let bbox = denormalize(boxes.slice(ndarray::s![0, i, ..]), width, height);
            ys.push(Detection::new(bbox, entry.name.clone(), score));
        }
        Ok(ys)
    }
}

fn tensor<'a>(outputs: &'a RawOutputs, name: &str) -> Result<ArrayViewD<'a, f32>, PostprocessError> {
    outputs
        .get(name)
        .ok_or_else(|| PostprocessError::MissingTensor(name.to_string()))
}

/// 检查 batch 维度为 1 并转换为固定维度
fn batch_of_one<'a, D: ndarray::Dimension>(
    t: ArrayViewD<'a, f32>,
    name: &str,
    expected: &str,
) -> Result<ndarray::ArrayView<'a, f32, D>, PostprocessError> {
    let shape = t.shape().to_vec();
    let bad = || PostprocessError::Shape {
        name: name.to_string(),
        expected: expected.to_string(),
        actual: shape.clone(),
    };
    if shape.first() != Some(&1) {
        return Err(bad());
    }
    t.into_dimensionality::<D>().map_err(|_| bad())
}

fn boxes_view<'a>(outputs: &'a RawOutputs, name: &str) -> Result<ArrayView3<'a, f32>, PostprocessError> {
    let boxes: ArrayView3<f32> = batch_of_one::<Ix3>(tensor(outputs, name)?, name, "[1, N, 4]")?;
    if boxes.shape()[2] != 4 {
        return Err(PostprocessError::Shape {
            name: name.to_string(),
            expected: "[1, N, 4]".into(),
            actual: boxes.shape().to_vec(),
        });
    }
    Ok(boxes)
}

fn check_candidates(name: &str, expected: usize, actual: usize) -> Result<(), PostprocessError> {
    if expected != actual {
        return Err(PostprocessError::CandidateCount {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_score(candidate: usize, score: f32) -> Result<(), PostprocessError> {
    if !(0.0..=1.0).contains(&score) {
        return Err(PostprocessError::Score { candidate, score });
    }
    Ok(())
}

/// 归一化的 [ymin, xmin, ymax, xmax] → 像素坐标 (x, y, w, h)
///
/// 坐标先截断到 [0, 1], 反向的框宽高为 0, 保证结果落在图片内。
pub fn denormalize(b: ArrayView1<f32>, width: u32, height: u32) -> Bbox {
    let clamp = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    let (ymin, xmin, ymax, xmax) = (clamp(b[0]), clamp(b[1]), clamp(b[2]), clamp(b[3]));
    let (w, h) = (width as f32, height as f32);

    let x = xmin * w;
    let y = ymin * h;
    let bw = ((xmax - xmin).max(0.0) * w).min(w - x).max(0.0);
    let bh = ((ymax - ymin).max(0.0) * h).min(h - y).max(0.0);
    Bbox::new_from_xywh(x, y, bw, bh)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ClassEntry;
    use crate::models::testing::tensor;
    use ndarray::arr1;

    fn names_a() -> OutputNames {
        OutputSchema::MultiClassScores.default_output_names()
    }

    fn names_b() -> OutputNames {
        OutputSchema::ArgmaxClass.default_output_names()
    }

    fn decoder_a(threshold: f32) -> DetectionDecoder {
        DetectionDecoder::new(
            OutputSchema::MultiClassScores,
            threshold,
            ClassCatalog::from_names(["A", "B"]),
            names_a(),
        )
        .unwrap()
    }

    fn decoder_b() -> DetectionDecoder {
        DetectionDecoder::new(
            OutputSchema::ArgmaxClass,
            0.7,
            ClassCatalog::from_names(["A", "B"]),
            names_b(),
        )
        .unwrap()
    }

    fn outputs_a(boxes: Vec<f32>, scores: Vec<f32>, n: usize, c: usize) -> RawOutputs {
        RawOutputs::new(vec![
            ("detection_boxes".into(), tensor(&[1, n, 4], boxes)),
            ("detection_multiclass_scores".into(), tensor(&[1, n, c], scores)),
        ])
    }

    fn outputs_b(boxes: Vec<f32>, scores: Vec<f32>, classes: Vec<f32>) -> RawOutputs {
        let n = scores.len();
        RawOutputs::new(vec![
            ("detection_boxes".into(), tensor(&[1, n, 4], boxes)),
            ("detection_scores".into(), tensor(&[1, n], scores)),
            ("detection_classes".into(), tensor(&[1, n], classes)),
        ])
    }

    fn assert_in_bounds(dets: &[Detection], w: u32, h: u32) {
        for d in dets {
            let b = d.bbox();
            assert!(b.xmin() >= 0.0 && b.ymin() >= 0.0, "{:?}", b);
            assert!(b.xmax() <= w as f32 && b.ymax() <= h as f32, "{:?}", b);
            assert!((0.0..=1.0).contains(&d.confidence()));
        }
    }

    #[test]
    fn test_denormalize_example() {
        let b = denormalize(arr1(&[0.1, 0.2, 0.5, 0.6]).view(), 1000, 800);
        assert!((b.xmin() - 200.0).abs() < 1e-3);
        assert!((b.ymin() - 80.0).abs() < 1e-3);
        assert!((b.width() - 400.0).abs() < 1e-3);
        assert!((b.height() - 320.0).abs() < 1e-3);
    }

    #[test]
    fn test_denormalize_stays_inside_image() {
        let cases = [
            [-0.5, -0.2, 1.5, 1.2],
            [0.9, 0.9, 0.1, 0.1],
            [0.0, 0.0, 1.0, 1.0],
            [0.3, 0.999_999, 1.0, 1.000_001],
            [f32::NAN, 0.5, 0.7, f32::NAN],
        ];
        for (w, h) in [(1000, 800), (3, 7), (1, 1)] {
            for c in cases.iter() {
                let b = denormalize(arr1(c).view(), w, h);
                assert!(b.xmin() >= 0.0 && b.ymin() >= 0.0, "{:?}", b);
                assert!(b.width() >= 0.0 && b.height() >= 0.0, "{:?}", b);
                assert!(b.xmax() <= w as f32, "{:?} {:?}", c, b);
                assert!(b.ymax() <= h as f32, "{:?} {:?}", c, b);
            }
        }
    }

    #[test]
    fn test_multiclass_single_class() {
        let dets = decoder_a(0.8)
            .decode(
                &outputs_a(vec![0.1, 0.2, 0.5, 0.6], vec![0.9, 0.2], 1, 2),
                1000,
                800,
            )
            .unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label(), "A");
        assert_eq!(dets[0].confidence(), 0.9);
    }

    #[test]
    fn test_multiclass_candidate_emits_several_classes() {
        let dets = decoder_a(0.8)
            .decode(
                &outputs_a(vec![0.1, 0.2, 0.5, 0.6], vec![0.9, 0.85], 1, 2),
                1000,
                800,
            )
            .unwrap();
        let labels: Vec<&str> = dets.iter().map(|d| d.label()).collect();
        assert_eq!(labels, vec!["A", "B"]);
        assert_eq!(dets[0].bbox(), dets[1].bbox());
        assert_in_bounds(&dets, 1000, 800);
    }

    #[test]
    fn test_multiclass_threshold_is_strict() {
        let dets = decoder_a(0.8)
            .decode(
                &outputs_a(vec![0.1, 0.2, 0.5, 0.6], vec![0.8, 0.0], 1, 2),
                100,
                100,
            )
            .unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_multiclass_uses_catalog_ids_as_columns() {
        // 第 0 列为背景, 类别从 1 开始
        let catalog = ClassCatalog::new(vec![
            ClassEntry {
                id: 1,
                name: "mercedes".into(),
            },
            ClassEntry {
                id: 2,
                name: "škoda".into(),
            },
        ])
        .unwrap();
        let decoder =
            DetectionDecoder::new(OutputSchema::MultiClassScores, 0.8, catalog, names_a()).unwrap();
        let dets = decoder
            .decode(
                &outputs_a(vec![0.0, 0.0, 0.5, 0.5], vec![0.99, 0.1, 0.95], 1, 3),
                10,
                10,
            )
            .unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label(), "škoda");

        // 分数矩阵列数不足
        let err = decoder
            .decode(&outputs_a(vec![0.0; 4], vec![0.9, 0.9], 1, 2), 10, 10)
            .unwrap_err();
        assert!(matches!(err, PostprocessError::ClassColumn { id: 2, .. }));
    }

    #[test]
    fn test_overlapping_boxes_are_not_suppressed() {
        let boxes = vec![0.1, 0.1, 0.5, 0.5, 0.12, 0.11, 0.52, 0.5];
        let dets = decoder_a(0.8)
            .decode(&outputs_a(boxes, vec![0.95, 0.0, 0.9, 0.0], 2, 2), 640, 480)
            .unwrap();
        assert_eq!(dets.len(), 2);
        assert!(dets.iter().all(|d| d.label() == "A"));
        assert!(dets[0].bbox().iou(dets[1].bbox()) > 0.8);
    }

    #[test]
    fn test_argmax_threshold_boundary() {
        let boxes = vec![0.1, 0.2, 0.5, 0.6, 0.1, 0.2, 0.5, 0.6];
        let dets = decoder_b()
            .decode(&outputs_b(boxes, vec![0.7, 0.70001], vec![1.0, 2.0]), 1000, 800)
            .unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label(), "B");
        assert_eq!(dets[0].confidence(), 0.70001);
        assert_in_bounds(&dets, 1000, 800);
    }

    #[test]
    fn test_argmax_reserved_class_is_an_error() {
        let err = decoder_b()
            .decode(
                &outputs_b(vec![0.1, 0.2, 0.5, 0.6], vec![0.95], vec![0.0]),
                100,
                100,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PostprocessError::ClassIndex { class_id: 0, .. }
        ));
    }

    #[test]
    fn test_argmax_class_outside_catalog_is_an_error() {
        let err = decoder_b()
            .decode(
                &outputs_b(vec![0.1, 0.2, 0.5, 0.6], vec![0.95], vec![3.0]),
                100,
                100,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PostprocessError::ClassIndex {
                class_id: 3,
                catalog_len: 2,
                ..
            }
        ));

        let err = decoder_b()
            .decode(
                &outputs_b(vec![0.1, 0.2, 0.5, 0.6], vec![0.95], vec![1.5]),
                100,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, PostprocessError::NonIntegralClass { .. }));
    }

    #[test]
    fn test_argmax_below_threshold_ignores_class() {
        // 低于阈值的候选框不产生检测, 其类别也不参与校验
        let dets = decoder_b()
            .decode(
                &outputs_b(vec![0.1, 0.2, 0.5, 0.6], vec![0.1], vec![0.0]),
                100,
                100,
            )
            .unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_score_above_one_is_an_error() {
        let err = decoder_b()
            .decode(
                &outputs_b(vec![0.1, 0.2, 0.5, 0.6], vec![1.5], vec![1.0]),
                100,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, PostprocessError::Score { .. }));
    }

    #[test]
    fn test_shape_errors() {
        let decoder = decoder_a(0.8);
        let missing = RawOutputs::new(vec![(
            "detection_boxes".into(),
            tensor(&[1, 1, 4], vec![0.0; 4]),
        )]);
        assert!(matches!(
            decoder.decode(&missing, 10, 10),
            Err(PostprocessError::MissingTensor(_))
        ));

        let bad_boxes = RawOutputs::new(vec![
            ("detection_boxes".into(), tensor(&[1, 1, 5], vec![0.0; 5])),
            ("detection_multiclass_scores".into(), tensor(&[1, 1, 2], vec![0.0; 2])),
        ]);
        assert!(matches!(
            decoder.decode(&bad_boxes, 10, 10),
            Err(PostprocessError::Shape { .. })
        ));

        let mismatch = RawOutputs::new(vec![
            ("detection_boxes".into(), tensor(&[1, 2, 4], vec![0.0; 8])),
            ("detection_multiclass_scores".into(), tensor(&[1, 1, 2], vec![0.0; 2])),
        ]);
        assert!(matches!(
            decoder.decode(&mismatch, 10, 10),
            Err(PostprocessError::CandidateCount { expected: 2, actual: 1, .. })
        ));

        let batch_two = RawOutputs::new(vec![
            ("detection_boxes".into(), tensor(&[2, 1, 4], vec![0.0; 8])),
            ("detection_multiclass_scores".into(), tensor(&[2, 1, 2], vec![0.0; 4])),
        ]);
        assert!(matches!(
            decoder.decode(&batch_two, 10, 10),
            Err(PostprocessError::Shape { .. })
        ));
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(DetectionDecoder::new(
            OutputSchema::ArgmaxClass,
            0.7,
            ClassCatalog::from_names(["A"]),
            names_a(),
        )
        .is_err());
        assert!(DetectionDecoder::new(
            OutputSchema::MultiClassScores,
            -0.1,
            ClassCatalog::from_names(["A"]),
            names_a(),
        )
        .is_err());
    }

    #[test]
    fn test_output_names_order() {
        assert_eq!(
            decoder_b().output_names(),
            vec!["detection_boxes", "detection_scores", "detection_classes"]
        );
    }
}
