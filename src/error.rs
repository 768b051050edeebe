// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 各阶段错误类型
// load → decode → inference → postprocess, 每个阶段独立的错误枚举,
// 由 PipelineError 汇总并带上阶段名

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::PipelineState;

/// 配置文件 / 命令行参数错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 模型加载失败 (会话级致命错误)
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to fetch model from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("model cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model artifact: {0}")]
    Parse(String),

    #[error("unsupported model input: {0}")]
    UnsupportedInput(String),

    #[error("model loading task aborted: {0}")]
    Join(String),
}

/// 图片解码失败 (仅影响当前上传)
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image buffer is empty")]
    Empty,

    #[error("unsupported image encoding")]
    UnsupportedFormat,

    #[error("corrupt {format:?} image: {source}")]
    Corrupt {
        format: image::ImageFormat,
        #[source]
        source: image::ImageError,
    },

    #[error("image has zero size ({width}x{height})")]
    ZeroSized { width: u32, height: u32 },

    #[error("scaled image {width}x{height} exceeds {max_pixels} pixels")]
    TooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("image decoding task aborted: {0}")]
    Join(String),
}

/// 推理失败: 输出名/形状与模型不匹配, 或运行时报错
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no output tensors requested")]
    NoOutputs,

    #[error("output `{0}` requested more than once")]
    DuplicateOutput(String),

    #[error("model has no output named `{name}` (available: {available:?})")]
    UnknownOutput {
        name: String,
        available: Vec<String>,
    },

    #[error("input tensor {actual:?} is incompatible with model input {expected:?}")]
    InputShape {
        expected: Vec<i64>,
        actual: Vec<usize>,
    },

    #[error("input tensor is {actual} but the model expects {expected}")]
    InputType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("output `{name}` has unsupported element type")]
    OutputType { name: String },

    #[error("backend returned {actual} tensors for {expected} requested outputs")]
    OutputCount { expected: usize, actual: usize },

    #[error("inference backend failed: {0}")]
    Backend(String),

    #[error("inference task aborted: {0}")]
    Join(String),
}

/// 后处理失败: 原始输出无法解码为合法检测框
#[derive(Debug, Error)]
pub enum PostprocessError {
    #[error("raw outputs are missing tensor `{0}`")]
    MissingTensor(String),

    #[error("tensor `{name}` has shape {actual:?}, expected {expected}")]
    Shape {
        name: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("tensor `{name}` has {actual} candidates but boxes has {expected}")]
    CandidateCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("class `{label}` (id {id}) has no score column (scores have {columns})")]
    ClassColumn {
        label: String,
        id: usize,
        columns: usize,
    },

    #[error("candidate {candidate}: class id {class_id} is outside the catalog (1..={catalog_len})")]
    ClassIndex {
        candidate: usize,
        class_id: usize,
        catalog_len: usize,
    },

    #[error("candidate {candidate}: class id {value} is not a non-negative integer")]
    NonIntegralClass { candidate: usize, value: f32 },

    #[error("candidate {candidate}: score {score} is outside [0, 1]")]
    Score { candidate: usize, score: f32 },
}

/// 流水线错误 = 阶段名 + 底层原因
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline not ready (state: {0:?})")]
    NotReady(PipelineState),

    #[error("load stage: {0}")]
    Load(#[from] LoadError),

    #[error("decode stage: {0}")]
    Decode(#[from] DecodeError),

    #[error("inference stage: {0}")]
    Inference(#[from] InferenceError),

    #[error("postprocess stage: {0}")]
    Postprocess(#[from] PostprocessError),

    #[error("run {0} was superseded by a newer upload")]
    Superseded(u64),
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::NotReady(_) | PipelineError::Load(_) => "load",
            PipelineError::Decode(_) => "decode",
            PipelineError::Inference(_) => "inference",
            PipelineError::Postprocess(_) => "postprocess",
            PipelineError::Superseded(_) => "publish",
        }
    }
}
