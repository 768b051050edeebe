//! 测试用的内存后端 (不依赖 ONNX Runtime)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ndarray::{ArrayD, IxDyn};

use super::{Backend, ModelLocation, ModelOpener};
use crate::error::{InferenceError, LoadError};
use crate::input::{InputEncoding, InputTensor};
use crate::ort_backend::TensorScope;

/// 返回固定输出的假后端
#[derive(Clone)]
pub(crate) struct MockBackend {
    outputs: Vec<(String, ArrayD<f32>)>,
    names: Vec<String>,
    encoding: InputEncoding,
    fail: bool,
    delay: Duration,
}

impl MockBackend {
    pub(crate) fn new(outputs: Vec<(&str, ArrayD<f32>)>) -> Self {
        let outputs: Vec<(String, ArrayD<f32>)> = outputs
            .into_iter()
            .map(|(n, t)| (n.to_string(), t))
            .collect();
        let names = outputs.iter().map(|(n, _)| n.clone()).collect();
        Self {
            outputs,
            names,
            encoding: InputEncoding::U8,
            fail: false,
            delay: Duration::ZERO,
        }
    }

    /// 一个候选框, 类别 1 分数 0.9
    pub(crate) fn schema_a_default() -> Self {
        Self::new(vec![
            (
                "detection_boxes",
                tensor(&[1, 1, 4], vec![0.1, 0.2, 0.5, 0.6]),
            ),
            (
                "detection_multiclass_scores",
                tensor(&[1, 1, 3], vec![0.0, 0.9, 0.1]),
            ),
        ])
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub(crate) fn tensor(shape: &[usize], data: Vec<f32>) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
}

impl Backend for MockBackend {
    fn input_encoding(&self) -> InputEncoding {
        self.encoding
    }

    fn output_names(&self) -> &[String] {
        &self.names
    }

    fn run(
        &self,
        scope: &TensorScope,
        input: &InputTensor,
        output_names: &[String],
    ) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let _input = scope.track(input.clone());
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(InferenceError::Backend("mock failure".into()));
        }
        let mut ys = Vec::new();
        for name in output_names {
            let (_, t) = self
                .outputs
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| InferenceError::UnknownOutput {
                    name: name.clone(),
                    available: self.names.clone(),
                })?;
            let staged = scope.track(t.clone());
            ys.push((*staged).clone());
        }
        Ok(ys)
    }

    fn summary(&self) -> String {
        format!("mock backend {:?}", self.names)
    }
}

/// 统计 open 次数的打开器
pub(crate) struct CountingOpener<F> {
    make: F,
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl<F> CountingOpener<F>
where
    F: Fn() -> MockBackend + Send + Sync + 'static,
{
    pub(crate) fn new(make: F) -> Self {
        Self {
            make,
            calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub(crate) fn failing_first(make: F) -> Self {
        let opener = Self::new(make);
        opener.fail_next.store(true, Ordering::SeqCst);
        opener
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> ModelOpener for CountingOpener<F>
where
    F: Fn() -> MockBackend + Send + Sync + 'static,
{
    fn open(&self, location: &ModelLocation) -> Result<Box<dyn Backend>, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // 模拟慢速加载, 让并发调用真正重叠
        std::thread::sleep(Duration::from_millis(50));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LoadError::Parse(format!("mock: cannot parse {}", location)));
        }
        Ok(Box::new((self.make)()))
    }
}
