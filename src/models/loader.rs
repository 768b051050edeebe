// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 模型加载器
// 异步加载 + 单次初始化: 并发的首次调用共享同一次初始化, 成功后直接返回缓存句柄

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use super::{Backend, Model, ModelLocation};
use crate::error::LoadError;
use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};

/// 打开模型文件, 返回推理后端 (阻塞操作, 由加载器放到阻塞线程池)
pub trait ModelOpener: Send + Sync + 'static {
    fn open(&self, location: &ModelLocation) -> Result<Box<dyn Backend>, LoadError>;
}

/// 模型加载器
pub struct ModelLoader {
    opener: Arc<dyn ModelOpener>,
    cell: OnceCell<Arc<Model>>,
}

impl ModelLoader {
    pub fn new(opener: Arc<dyn ModelOpener>) -> Self {
        Self {
            opener,
            cell: OnceCell::new(),
        }
    }

    /// 加载模型; 失败时缓存保持为空, 可再次调用重试
    pub async fn load(&self, location: &ModelLocation) -> Result<Arc<Model>, LoadError> {
        let model = self
            .cell
            .get_or_try_init(|| async {
                info!("📦 加载模型: {}", location);
                let t = Instant::now();
                let opener = self.opener.clone();
                let loc = location.clone();
                let backend = tokio::task::spawn_blocking(move || opener.open(&loc))
                    .await
                    .map_err(|e| LoadError::Join(e.to_string()))?
                    .map_err(|e| {
                        error!("❌ 模型加载失败: {}", e);
                        e
                    })?;
                info!("✅ 模型加载完成 ({:?}): {}", t.elapsed(), backend.summary());
                Ok::<_, LoadError>(Arc::new(Model::new(location.clone(), backend)))
            })
            .await?;

        if model.location() != location {
            warn!(
                "⚠️ 模型已从 {} 加载, 忽略新位置 {}",
                model.location(),
                location
            );
        }
        Ok(model.clone())
    }

    /// 已缓存的模型
    pub fn get(&self) -> Option<Arc<Model>> {
        self.cell.get().cloned()
    }
}

/// ONNX Runtime 模型打开器: 本地路径直接加载, URL 先下载到缓存目录
#[derive(Debug, Clone)]
pub struct OrtOpener {
    pub ep: OrtEP,
    pub input_name: Option<String>,
    pub intra_threads: usize,
    pub cache_dir: PathBuf,
}

impl OrtOpener {
    pub fn new(ep: OrtEP, input_name: Option<String>, intra_threads: usize) -> Self {
        Self {
            ep,
            input_name,
            intra_threads,
            cache_dir: default_cache_dir(),
        }
    }
}

impl ModelOpener for OrtOpener {
    fn open(&self, location: &ModelLocation) -> Result<Box<dyn Backend>, LoadError> {
        let f = match location {
            ModelLocation::Path(p) => p.clone(),
            ModelLocation::Url(url) => fetch(url, &self.cache_dir)?,
        };
        let backend = OrtBackend::build(OrtConfig {
            f,
            ep: self.ep,
            input_name: self.input_name.clone(),
            intra_threads: self.intra_threads,
        })?;
        Ok(Box::new(backend))
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tfod-rs")
}

/// 缓存文件名: URL 最后一段, 查询参数去掉
fn cache_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.contains(':') => name.to_string(),
        _ => "model.onnx".to_string(),
    }
}

/// 缓存位置: <cache_dir>/<URL 摘要>/<文件名>, 不同 URL 即使文件名相同也互不覆盖
pub fn cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    let digest = Sha256::digest(url.as_bytes());
    cache_dir
        .join(hex::encode(&digest[..8]))
        .join(cache_file_name(url))
}

/// 下载模型到缓存目录 (已存在则直接复用)
pub fn fetch(url: &str, cache_dir: &Path) -> Result<PathBuf, LoadError> {
    let target = cache_path(cache_dir, url);
    if target.is_file() {
        info!("📁 使用已缓存的模型: {}", target.display());
        return Ok(target);
    }

    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    info!("🌐 下载模型: {}", url);
    let response = ureq::get(url).call().map_err(|e| LoadError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    // 先写临时文件, 完整下载后再改名, 避免留下半个文件
    let partial = target.with_extension("part");
    let mut file = fs::File::create(&partial)?;
    if let Err(e) = io::copy(&mut response.into_reader(), &mut file) {
        let _ = fs::remove_file(&partial);
        return Err(LoadError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        });
    }
    drop(file);
    fs::rename(&partial, &target)?;
    info!("💾 模型已保存到 {}", target.display());
    Ok(target)
}
