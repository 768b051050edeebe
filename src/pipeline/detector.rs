// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测流水线
// 职责: 加载模型 → 每次上传: 解码 → 推理 → 解码检测结果 → 发布
//
// 每次上传分配一个递增的 generation, 新上传开始时立即发布空结果,
// 旧的运行即使完成也不会覆盖新结果

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::{DetectionSet, InferenceExecutor, PipelineState};
use crate::config::DetectorConfig;
use crate::detection::DetectionDecoder;
use crate::error::{ConfigError, DecodeError, PipelineError};
use crate::input::ImagePreprocessor;
use crate::models::{Model, ModelLoader, ModelLocation, ModelOpener, OrtOpener};
use crate::ort_backend::OrtEP;

/// 模型加载完成后才能构造的检测上下文
pub struct DetectionContext {
    model: Arc<Model>,
    preprocessor: ImagePreprocessor,
    decoder: DetectionDecoder,
    executor: InferenceExecutor,
    profile: bool,
}

impl DetectionContext {
    pub fn new(
        model: Arc<Model>,
        decoder: DetectionDecoder,
        display_width: Option<u32>,
        profile: bool,
    ) -> Self {
        let preprocessor = ImagePreprocessor::new(display_width, model.input_encoding());
        Self {
            model,
            preprocessor,
            decoder,
            executor: InferenceExecutor::new(profile),
            profile,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    pub fn decoder(&self) -> &DetectionDecoder {
        &self.decoder
    }

    pub fn executor(&self) -> &InferenceExecutor {
        &self.executor
    }

    /// 单张图片的完整检测
    pub async fn detect(
        &self,
        generation: u64,
        bytes: &[u8],
    ) -> Result<DetectionSet, PipelineError> {
        let t_pre = Instant::now();
        let pre = self.preprocessor.clone();
        let bytes = bytes.to_vec();
        let (width, height, x) = tokio::task::spawn_blocking(move || {
            let image = pre.decode(&bytes)?;
            let x = pre.to_tensor(&image);
            Ok::<_, DecodeError>((image.width(), image.height(), x))
        })
        .await
        .map_err(|e| DecodeError::Join(e.to_string()))??;
        let t_pre = t_pre.elapsed();

        let t_run = Instant::now();
        let outputs = self
            .executor
            .run(&self.model, x, &self.decoder.output_names())
            .await?;
        let t_run = t_run.elapsed();

        let t_post = Instant::now();
        let detections = self.decoder.decode(&outputs, width, height)?;
        let t_post = t_post.elapsed();

        if self.profile {
            info!(
                "⏱️ [{}] 预处理: {:?} | 推理: {:?} | 后处理: {:?}",
                generation, t_pre, t_run, t_post
            );
        }

        Ok(DetectionSet {
            generation,
            width,
            height,
            detections,
        })
    }
}

/// 检测流水线
pub struct Pipeline {
    config: DetectorConfig,
    location: ModelLocation,
    decoder: DetectionDecoder,
    loader: ModelLoader,
    context: OnceLock<Arc<DetectionContext>>,
    state: watch::Sender<PipelineState>,
    results: watch::Sender<DetectionSet>,
    generation: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
}

impl Pipeline {
    pub fn new(config: DetectorConfig, opener: Arc<dyn ModelOpener>) -> Result<Self, ConfigError> {
        config.validate()?;
        let decoder = DetectionDecoder::from_config(&config)?;
        let location = ModelLocation::parse(&config.model);
        let (state, _) = watch::channel(PipelineState::Uninitialized);
        let (results, _) = watch::channel(DetectionSet::default());
        Ok(Self {
            config,
            location,
            decoder,
            loader: ModelLoader::new(opener),
            context: OnceLock::new(),
            state,
            results,
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        })
    }

    /// 使用 ONNX Runtime 后端
    pub fn with_ort(config: DetectorConfig) -> Result<Self, ConfigError> {
        let opener = OrtOpener::new(
            OrtEP::from_flags(config.cuda, config.trt, config.device_id),
            config.input_name.clone(),
            config.intra_threads,
        );
        Self::new(config, Arc::new(opener))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionSet> {
        self.results.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn context(&self) -> Option<&Arc<DetectionContext>> {
        self.context.get()
    }

    /// 最新的检测结果
    pub fn latest(&self) -> DetectionSet {
        self.results.borrow().clone()
    }

    /// 加载模型; 已加载时直接返回, 失败后可再次调用重试
    pub async fn load(&self) -> Result<(), PipelineError> {
        if self.context.get().is_some() {
            return Ok(());
        }
        self.state.send_replace(PipelineState::Loading);

        let model = match self.loader.load(&self.location).await {
            Ok(m) => m,
            Err(e) => {
                self.state.send_replace(PipelineState::LoadFailed);
                return Err(e.into());
            }
        };

        for name in self.decoder.output_names() {
            if !model.output_names().contains(&name) {
                warn!("⚠️ 模型没有输出 {:?}, 可用: {:?}", name, model.output_names());
            }
        }

        self.context.get_or_init(|| {
            Arc::new(DetectionContext::new(
                model,
                self.decoder.clone(),
                self.config.display_width,
                self.config.profile,
            ))
        });
        self.state.send_replace(PipelineState::Ready);
        info!("🚀 流水线就绪");
        Ok(())
    }

    /// 分配新的 generation 并清空已发布的结果
    fn begin(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.results.send_replace(DetectionSet::cleared(generation));
        debug!("新上传: generation {}", generation);
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// 处理一次上传
    ///
    /// 失败时已发布的结果保持为空; 被更新的上传取代时返回 `Superseded`
    pub async fn process(&self, bytes: &[u8]) -> Result<DetectionSet, PipelineError> {
        let generation = self.begin();
        self.run(generation, bytes).await
    }

    /// 后台处理一次上传, 同时取消上一次尚未完成的处理
    pub fn submit(
        self: &Arc<Self>,
        bytes: Vec<u8>,
    ) -> JoinHandle<Result<DetectionSet, PipelineError>> {
        let generation = self.begin();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(generation, &bytes).await });

        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = slot.replace(handle.abort_handle()) {
            prev.abort();
        }
        handle
    }

    async fn run(&self, generation: u64, bytes: &[u8]) -> Result<DetectionSet, PipelineError> {
        let ctx = match self.context.get() {
            Some(ctx) => ctx.clone(),
            None => return Err(PipelineError::NotReady(self.state())),
        };

        self.state.send_replace(PipelineState::Decoding);
        let result = {
            let _decoding = DecodingGuard {
                pipeline: self,
                generation,
            };
            ctx.detect(generation, bytes).await
        };

        let set = match result {
            Ok(set) => set,
            Err(e) => {
                warn!("❌ [{}] {} 阶段失败: {}", generation, e.stage(), e);
                return Err(e);
            }
        };

        let mut pending = Some(set.clone());
        let published = self.results.send_if_modified(|current| {
            if current.generation != generation {
                return false;
            }
            if let Some(set) = pending.take() {
                *current = set;
            }
            true
        });
        if !published {
            debug!("丢弃过期结果: generation {}", generation);
            return Err(PipelineError::Superseded(generation));
        }

        info!("🎯 [{}] 检测到 {} 个目标", generation, set.len());
        Ok(set)
    }
}

/// 运行结束 (包括 future 被丢弃或任务被取消) 时, 最新一次运行把状态恢复为 Ready
struct DecodingGuard<'a> {
    pipeline: &'a Pipeline,
    generation: u64,
}

impl Drop for DecodingGuard<'_> {
    fn drop(&mut self) {
        if self.pipeline.is_current(self.generation) {
            self.pipeline.state.send_replace(PipelineState::Ready);
        }
    }
}
