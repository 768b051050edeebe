// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测器配置: JSON 配置文件 + 命令行参数覆盖

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detection::{ClassCatalog, ClassEntry};
use crate::error::ConfigError;

/// 模型输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// 每个候选框 × 每个类别一个分数: boxes[1,N,4] + scores[1,N,C]
    #[default]
    MultiClassScores,
    /// 每个候选框一个最佳类别: boxes[1,N,4] + scores[1,N] + classes[1,N]
    ArgmaxClass,
}

impl OutputSchema {
    /// 推荐的置信度阈值
    pub fn default_threshold(&self) -> f32 {
        match self {
            OutputSchema::MultiClassScores => 0.8,
            OutputSchema::ArgmaxClass => 0.7,
        }
    }

    /// 输出名必须与格式匹配: 只有 ArgmaxClass 需要 class_ids
    pub fn check_output_names(&self, names: &OutputNames) -> Result<(), ConfigError> {
        match (self, &names.class_ids) {
            (OutputSchema::ArgmaxClass, None) => {
                return Err(ConfigError::Invalid(
                    "argmax_class schema needs a class_ids output name".into(),
                ))
            }
            (OutputSchema::MultiClassScores, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "multi_class_scores schema takes no class_ids output".into(),
                ))
            }
            _ => {}
        }
        if names.ordered().iter().any(|n| n.is_empty()) {
            return Err(ConfigError::Invalid("output names must not be empty".into()));
        }
        Ok(())
    }

    /// TF Object Detection 导出模型的默认输出名
    pub fn default_output_names(&self) -> OutputNames {
        match self {
            OutputSchema::MultiClassScores => OutputNames {
                boxes: "detection_boxes".into(),
                scores: "detection_multiclass_scores".into(),
                class_ids: None,
            },
            OutputSchema::ArgmaxClass => OutputNames {
                boxes: "detection_boxes".into(),
                scores: "detection_scores".into(),
                class_ids: Some("detection_classes".into()),
            },
        }
    }
}

/// 需要请求的输出张量名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputNames {
    pub boxes: String,
    pub scores: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_ids: Option<String>,
}

impl OutputNames {
    /// 请求顺序: boxes, scores[, class_ids]
    pub fn ordered(&self) -> Vec<String> {
        let mut names = vec![self.boxes.clone(), self.scores.clone()];
        if let Some(class_ids) = &self.class_ids {
            names.push(class_ids.clone());
        }
        names
    }
}

/// 检测器配置 (每个部署的模型一份)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// 模型位置: 本地路径或 http(s) URL
    pub model: String,
    pub schema: OutputSchema,
    /// 为空时使用 schema 的默认输出名
    pub outputs: Option<OutputNames>,
    /// 为空时使用模型的第一个输入
    pub input_name: Option<String>,
    pub classes: ClassCatalog,
    /// 为空时使用 schema 的默认阈值
    pub threshold: Option<f32>,
    /// 显示宽度: 图片先按比例缩放到该宽度再送入模型
    pub display_width: Option<u32>,
    pub cuda: bool,
    pub trt: bool,
    pub device_id: i32,
    pub intra_threads: usize,
    pub profile: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: "models/model.onnx".into(),
            schema: OutputSchema::MultiClassScores,
            outputs: None,
            input_name: None,
            classes: [
                ClassEntry {
                    id: 1,
                    name: "mercedes".into(),
                },
                ClassEntry {
                    id: 2,
                    name: "škoda".into(),
                },
            ]
            .into_iter()
            .collect(),
            threshold: None,
            display_width: None,
            cuda: false,
            trt: false,
            device_id: 0,
            intra_threads: 4,
            profile: false,
        }
    }
}

impl DetectorConfig {
    /// 从JSON文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
            .unwrap_or_else(|| self.schema.default_threshold())
    }

    pub fn output_names(&self) -> OutputNames {
        self.outputs
            .clone()
            .unwrap_or_else(|| self.schema.default_output_names())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model location is empty".into()));
        }
        let threshold = self.threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold {} is outside [0, 1]",
                threshold
            )));
        }
        if self.display_width == Some(0) {
            return Err(ConfigError::Invalid("display_width must be positive".into()));
        }
        self.schema.check_output_names(&self.output_names())?;
        self.classes.validate()
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前检测配置:");
        info!("  模型: {}", self.model);
        info!("  输出格式: {:?}", self.schema);
        info!("  输出张量: {:?}", self.output_names().ordered());
        info!("  置信度阈值: {:.2}", self.threshold());
        info!("  类别: {:?}", self.classes.names());
        if let Some(w) = self.display_width {
            info!("  显示宽度: {}", w);
        }
    }
}

/// 命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "单张图片目标检测 (ONNX Runtime)", long_about = None)]
pub struct Args {
    /// JSON配置文件
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 模型路径或URL (覆盖配置文件)
    #[arg(short, long)]
    pub model: Option<String>,

    /// 输出格式 (覆盖配置文件)
    #[arg(long, value_enum)]
    pub schema: Option<OutputSchema>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// 显示宽度 (像素)
    #[arg(long)]
    pub display_width: Option<u32>,

    /// 使用 CUDA
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT
    #[arg(long)]
    pub trt: bool,

    /// GPU 设备号
    #[arg(long)]
    pub device_id: Option<i32>,

    /// 打印各阶段耗时
    #[arg(long)]
    pub profile: bool,

    /// 保存画框后的图片到该目录
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// 待检测图片
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
}

impl Args {
    /// 合并配置文件与命令行参数
    pub fn resolve(&self) -> Result<DetectorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::load(path)?,
            None => DetectorConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(schema) = self.schema {
            if schema != config.schema {
                // 换了格式, 输出名回到该格式的默认值
                config.outputs = None;
                config.threshold = None;
            }
            config.schema = schema;
        }
        if let Some(conf) = self.conf {
            config.threshold = Some(conf);
        }
        if let Some(width) = self.display_width {
            config.display_width = Some(width);
        }
        if let Some(device_id) = self.device_id {
            config.device_id = device_id;
        }
        config.cuda |= self.cuda;
        config.trt |= self.trt;
        config.profile |= self.profile;

        config.validate()?;
        Ok(config)
    }
}
