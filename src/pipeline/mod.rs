/// 检测流水线 (Detection Pipeline)
///
/// 上传的图片依次经过:
/// - Preprocess: 解码 + 缩放 → 输入张量
/// - Executor:   阻塞线程池中执行推理, 张量生命周期受作用域约束
/// - Decoder:    原始输出 → 检测结果
///
/// 结果通过 watch 通道发布, 只有最新一次上传的结果会被发布
pub mod detector;
pub mod executor;

use serde::Serialize;

use crate::detection::Detection;

pub use detector::{DetectionContext, Pipeline};
pub use executor::InferenceExecutor;

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Decoding,
    LoadFailed,
}

/// 一次上传对应的检测结果
///
/// 坐标以显示图片 (`width` x `height`) 为参考系
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub generation: u64,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    /// 新上传开始时发布的空结果
    pub fn cleared(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
