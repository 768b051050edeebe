// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 检测配置与命令行参数
pub mod detection; // 检测结果与后处理
pub mod error; // 各阶段错误类型
pub mod input; // 图片解码与预处理
pub mod models; // 模型句柄与加载
pub mod ort_backend; // ONNX Runtime 后端
pub mod output; // 检测框绘制
pub mod pipeline; // 检测流水线

pub use crate::config::{Args, DetectorConfig, OutputNames, OutputSchema};
pub use crate::detection::{Bbox, ClassCatalog, ClassEntry, Detection, DetectionDecoder};
pub use crate::error::{
    ConfigError, DecodeError, InferenceError, LoadError, PipelineError, PostprocessError,
};
pub use crate::input::{ImagePreprocessor, InputEncoding, InputTensor};
pub use crate::models::{Backend, Model, ModelLoader, ModelLocation, RawOutputs};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::pipeline::{DetectionSet, InferenceExecutor, Pipeline, PipelineState};
