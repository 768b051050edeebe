/// 模型句柄与加载
///
/// # 架构说明
///
/// ## Backend Trait
/// 推理引擎的统一接口: 输入张量 + 输出名 → 按请求顺序返回的原始输出
/// - **OrtBackend**: ONNX Runtime 实现 (`ort_backend.rs`)
/// - 测试中使用内存中的假后端
///
/// ## Model
/// 加载完成后不可变的模型句柄, 由流水线以 `Arc<Model>` 共享给推理执行器
///
/// ## ModelLoader
/// 异步加载 + 单次初始化缓存 (`loader.rs`)
///
/// ```text
/// 模型位置(路径/URL) → ModelOpener → Backend → Arc<Model>
///                                   ↓
///        InputTensor → Backend::run → RawOutputs
/// ```
pub mod loader;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::PathBuf;

use ndarray::{ArrayD, ArrayViewD};

use crate::error::InferenceError;
use crate::input::{InputEncoding, InputTensor};
use crate::ort_backend::TensorScope;

pub use loader::{ModelLoader, ModelOpener, OrtOpener};

/// 统一的推理后端接口
pub trait Backend: Send + Sync {
    /// 模型期望的输入元素类型
    fn input_encoding(&self) -> InputEncoding;

    /// 模型声明的全部输出名
    fn output_names(&self) -> &[String];

    /// 推理: 执行模型前向传播
    ///
    /// # Arguments
    /// * `scope` - 本次调用的张量作用域, 所有中间张量都要在此登记
    /// * `input` - [1, H, W, 3] 输入张量
    /// * `output_names` - 需要的输出, 返回值与其顺序一致
    fn run(
        &self,
        scope: &TensorScope,
        input: &InputTensor,
        output_names: &[String],
    ) -> Result<Vec<ArrayD<f32>>, InferenceError>;

    /// 模型信息
    fn summary(&self) -> String;
}

/// 模型位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    Path(PathBuf),
    Url(String),
}

impl ModelLocation {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.starts_with("http://") || s.starts_with("https://") {
            ModelLocation::Url(s.to_string())
        } else {
            ModelLocation::Path(PathBuf::from(s))
        }
    }
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLocation::Path(p) => write!(f, "{}", p.display()),
            ModelLocation::Url(u) => write!(f, "{}", u),
        }
    }
}

/// 不可变的模型句柄
pub struct Model {
    location: ModelLocation,
    backend: Box<dyn Backend>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("location", &self.location)
            .field("backend", &self.backend.summary())
            .finish()
    }
}

impl Model {
    pub fn new(location: ModelLocation, backend: Box<dyn Backend>) -> Self {
        Self { location, backend }
    }

    pub fn location(&self) -> &ModelLocation {
        &self.location
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn input_encoding(&self) -> InputEncoding {
        self.backend.input_encoding()
    }

    pub fn output_names(&self) -> &[String] {
        self.backend.output_names()
    }
}

/// 推理的原始输出, 按请求顺序排列
#[derive(Debug, Clone, Default)]
pub struct RawOutputs {
    tensors: Vec<(String, ArrayD<f32>)>,
}

impl RawOutputs {
    pub fn new(tensors: Vec<(String, ArrayD<f32>)>) -> Self {
        Self { tensors }
    }

    pub fn get(&self, name: &str) -> Option<ArrayViewD<'_, f32>> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.view())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
