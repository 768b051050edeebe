// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 单张图片目标检测
///
/// 加载配置与模型 → 逐张检测 → 输出 JSON (可选保存画框后的图片)
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tfod_rs::output::annotate;
use tfod_rs::{Args, DetectionSet, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = args.resolve().context("配置无效")?;
    config.print_summary();

    let pipeline = Pipeline::with_ort(config).context("配置无效")?;
    pipeline.load().await.context("模型加载失败")?;

    if let Some(dir) = &args.save_dir {
        fs::create_dir_all(dir).with_context(|| format!("无法创建目录 {}", dir.display()))?;
    }

    let mut failed = 0;
    for path in &args.images {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                error!("❌ 无法读取 {}: {}", path.display(), e);
                failed += 1;
                continue;
            }
        };

        match pipeline.process(&bytes).await {
            Ok(set) => {
                println!("{}", serde_json::to_string_pretty(&set)?);
                if let Some(dir) = &args.save_dir {
                    if let Err(e) = save_annotated(&pipeline, &bytes, &set, path, dir) {
                        error!("❌ 保存失败 {}: {:#}", path.display(), e);
                    }
                }
            }
            Err(e) => {
                error!("❌ {} [{}]: {}", path.display(), e.stage(), e);
                failed += 1;
            }
        }
    }

    info!("✅ 完成: {} 张, 失败 {} 张", args.images.len(), failed);
    Ok(())
}

fn save_annotated(
    pipeline: &Pipeline,
    bytes: &[u8],
    set: &DetectionSet,
    path: &Path,
    dir: &Path,
) -> Result<()> {
    let ctx = pipeline.context().context("流水线未就绪")?;
    let image = ctx.preprocessor().decode(bytes)?;
    let canvas = annotate(image.rgb(), &set.detections, &pipeline.config().classes);

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let out = dir.join(format!("{}_det.png", stem));
    canvas.save(&out)?;
    info!("💾 已保存 {}", out.display());
    Ok(())
}
