// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 会话构建 + 按名称取输出 + 张量作用域 (每次推理分配的张量在作用域结束时全部释放)

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::ArrayD;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Value, ValueType};
use tracing::{debug, info};

use crate::error::{InferenceError, LoadError};
use crate::input::{InputEncoding, InputTensor};
use crate::models::Backend;

/// 执行设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

impl OrtEP {
    pub fn from_flags(cuda: bool, trt: bool, device_id: i32) -> Self {
        if trt {
            OrtEP::Trt(device_id)
        } else if cuda {
            OrtEP::CUDA(device_id)
        } else {
            OrtEP::CPU
        }
    }
}

/// 后端构建参数
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub input_name: Option<String>,
    pub intra_threads: usize,
}

/// 张量作用域
///
/// 一次推理内分配的张量 (包括输入) 都通过 `track` 登记, 返回的 [`Scoped`]
/// 借用作用域本身, 因此不可能活得比作用域更久; 任何退出路径上都会被释放。
pub struct TensorScope {
    live: Arc<AtomicUsize>,
    acquired: Cell<usize>,
}

impl TensorScope {
    pub fn new(live: Arc<AtomicUsize>) -> Self {
        Self {
            live,
            acquired: Cell::new(0),
        }
    }

    pub fn track<T>(&self, tensor: T) -> Scoped<'_, T> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.acquired.set(self.acquired.get() + 1);
        Scoped {
            inner: tensor,
            scope: self,
        }
    }

    /// 本作用域累计登记的张量数
    pub fn acquired(&self) -> usize {
        self.acquired.get()
    }
}

impl Drop for TensorScope {
    fn drop(&mut self) {
        debug!(
            "张量作用域结束: 释放 {} 个张量, 剩余 {}",
            self.acquired.get(),
            self.live.load(Ordering::SeqCst)
        );
    }
}

/// 作用域内的张量
pub struct Scoped<'s, T> {
    inner: T,
    scope: &'s TensorScope,
}

impl<T> Deref for Scoped<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Scoped<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for Scoped<'_, T> {
    fn drop(&mut self) {
        self.scope.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// ONNX Runtime 会话
pub struct OrtBackend {
    session: Mutex<Session>,
    ep: OrtEP,
    input_name: String,
    input_dims: Vec<i64>,
    encoding: InputEncoding,
    outputs: Vec<String>,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self, LoadError> {
        let parse = |e: ort::Error| LoadError::Parse(e.to_string());

        if !config.f.exists() {
            return Err(LoadError::NotFound(config.f));
        }

        let builder = Session::builder()
            .map_err(parse)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(parse)?
            .with_intra_threads(config.intra_threads.max(1))
            .map_err(parse)?;

        // execution provider (CUDA/TensorRT 不可用时 ort 会回退到 CPU)
        let builder = match config.ep {
            OrtEP::CPU => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])
            }
            OrtEP::CUDA(id) => builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(id)
                .build()]),
            OrtEP::Trt(id) => builder.with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(id)
                    .build(),
                CUDAExecutionProvider::default().with_device_id(id).build(),
            ]),
        }
        .map_err(parse)?;

        let session = builder.commit_from_file(&config.f).map_err(parse)?;

        let input = match &config.input_name {
            Some(name) => session.inputs.iter().find(|i| &i.name == name).ok_or_else(|| {
                LoadError::UnsupportedInput(format!("model has no input named `{}`", name))
            })?,
            None => session
                .inputs
                .first()
                .ok_or_else(|| LoadError::UnsupportedInput("model has no inputs".into()))?,
        };

        let (encoding, input_dims) = match &input.input_type {
            ValueType::Tensor { ty, shape, .. } => {
                let encoding = match ty {
                    TensorElementType::Uint8 => InputEncoding::U8,
                    TensorElementType::Float32 => InputEncoding::F32,
                    other => {
                        return Err(LoadError::UnsupportedInput(format!(
                            "input `{}` has element type {:?}",
                            input.name, other
                        )))
                    }
                };
                (encoding, shape.iter().copied().collect::<Vec<i64>>())
            }
            other => {
                return Err(LoadError::UnsupportedInput(format!(
                    "input `{}` is not a tensor: {:?}",
                    input.name, other
                )))
            }
        };

        if input_dims.len() != 4 || (input_dims[3] > 0 && input_dims[3] != 3) {
            return Err(LoadError::UnsupportedInput(format!(
                "input `{}` has shape {:?}, expected [1, H, W, 3]",
                input.name, input_dims
            )));
        }

        let input_name = input.name.clone();
        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        info!(
            "✅ ONNX 模型加载成功: {} (输入 {} {:?} {:?})",
            config.f.display(),
            input_name,
            input_dims,
            encoding
        );
        debug!("模型输出: {:?}", outputs);

        Ok(Self {
            session: Mutex::new(session),
            ep: config.ep,
            input_name,
            input_dims,
            encoding,
            outputs,
        })
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }
}

/// 检查输入张量与模型声明的元素类型 / 形状是否一致 (维度 <= 0 表示动态)
fn check_input(
    encoding: InputEncoding,
    dims: &[i64],
    input: &InputTensor,
) -> Result<(), InferenceError> {
    if input.encoding() != encoding {
        return Err(InferenceError::InputType {
            expected: encoding.name(),
            actual: input.encoding().name(),
        });
    }
    let actual = input.shape();
    let compatible = actual.len() == dims.len()
        && dims
            .iter()
            .zip(actual.iter())
            .all(|(&want, &got)| want <= 0 || want as usize == got);
    if !compatible {
        return Err(InferenceError::InputShape {
            expected: dims.to_vec(),
            actual,
        });
    }
    Ok(())
}

impl Backend for OrtBackend {
    fn input_encoding(&self) -> InputEncoding {
        self.encoding
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn run(
        &self,
        scope: &TensorScope,
        input: &InputTensor,
        output_names: &[String],
    ) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        check_input(self.encoding, &self.input_dims, input)?;
        for name in output_names {
            if !self.outputs.contains(name) {
                return Err(InferenceError::UnknownOutput {
                    name: name.clone(),
                    available: self.outputs.clone(),
                });
            }
        }

        let backend = |e: ort::Error| InferenceError::Backend(e.to_string());
        let value: DynValue = match input {
            InputTensor::U8(xs) => Value::from_array(xs.clone()).map_err(backend)?.into_dyn(),
            InputTensor::F32(xs) => Value::from_array(xs.clone()).map_err(backend)?.into_dyn(),
        };
        let value = scope.track(value);

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Backend("session mutex poisoned".into()))?;
        let outputs = scope.track(
            session
                .run(ort::inputs![self.input_name.as_str() => &*value])
                .map_err(backend)?,
        );

        let ys = output_names
            .iter()
            .map(|name| extract_f32(name, &outputs[name.as_str()]))
            .collect::<Result<Vec<_>, _>>();
        ys
    }

    fn summary(&self) -> String {
        format!(
            "ONNX Runtime ({:?}) input {} {:?} {:?}, outputs {:?}",
            self.ep, self.input_name, self.input_dims, self.encoding, self.outputs
        )
    }
}

/// 输出统一转为 f32 (类别id 可能导出为整型)
fn extract_f32(name: &str, value: &DynValue) -> Result<ArrayD<f32>, InferenceError> {
    if let Ok(xs) = value.try_extract_array::<f32>() {
        return Ok(xs.to_owned());
    }
    if let Ok(xs) = value.try_extract_array::<i64>() {
        return Ok(xs.mapv(|v| v as f32));
    }
    if let Ok(xs) = value.try_extract_array::<i32>() {
        return Ok(xs.mapv(|v| v as f32));
    }
    if let Ok(xs) = value.try_extract_array::<u8>() {
        return Ok(xs.mapv(f32::from));
    }
    Err(InferenceError::OutputType {
        name: name.to_string(),
    })
}
