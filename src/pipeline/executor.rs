// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 推理执行器
// 输入张量 + 输出名 → 原始输出; 推理放在阻塞线程池, 不占用异步运行时

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::ArrayD;
use tracing::{debug, info};

use crate::error::InferenceError;
use crate::input::InputTensor;
use crate::models::{Model, RawOutputs};
use crate::ort_backend::TensorScope;

#[derive(Debug, Default)]
pub struct InferenceExecutor {
    live: Arc<AtomicUsize>,
    profile: bool,
}

impl InferenceExecutor {
    pub fn new(profile: bool) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            profile,
        }
    }

    /// 当前仍存活的中间张量数量, 任何一次 run 返回后都应回到调用前的值
    pub fn live_tensors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 执行推理
    ///
    /// 返回的输出与 `output_names` 顺序一致
    pub async fn run(
        &self,
        model: &Arc<Model>,
        input: InputTensor,
        output_names: &[String],
    ) -> Result<RawOutputs, InferenceError> {
        check_names(model, output_names)?;

        let t = Instant::now();
        let model = model.clone();
        let names = output_names.to_vec();
        let live = self.live.clone();
        let ys = tokio::task::spawn_blocking(move || -> Result<Vec<(String, ArrayD<f32>)>, InferenceError> {
            let scope = TensorScope::new(live);
            let input = scope.track(input);
            let ys = model.backend().run(&scope, &input, &names)?;
            if ys.len() != names.len() {
                return Err(InferenceError::OutputCount {
                    expected: names.len(),
                    actual: ys.len(),
                });
            }
            Ok(names.into_iter().zip(ys).collect())
        })
        .await
        .map_err(|e| InferenceError::Join(e.to_string()))??;

        if self.profile {
            info!("⏱️ 推理耗时: {:?}", t.elapsed());
        }
        debug!("推理完成, 存活张量: {}", self.live_tensors());
        Ok(RawOutputs::new(ys))
    }
}

fn check_names(model: &Model, output_names: &[String]) -> Result<(), InferenceError> {
    if output_names.is_empty() {
        return Err(InferenceError::NoOutputs);
    }
    let mut seen = HashSet::new();
    for name in output_names {
        if !seen.insert(name.as_str()) {
            return Err(InferenceError::DuplicateOutput(name.clone()));
        }
        if !model.output_names().iter().any(|n| n == name) {
            return Err(InferenceError::UnknownOutput {
                name: name.clone(),
                available: model.output_names().to_vec(),
            });
        }
    }
    Ok(())
}
