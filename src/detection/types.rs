// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测结果数据结构
// 检测框 / 检测结果 / 类别表, 检测结果以 JSON 交给渲染端

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 检测框 (像素坐标, 左上角 + 宽高)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Bbox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl Bbox {
    pub fn new_from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn xmin(&self) -> f32 {
        self.x
    }

    pub fn ymin(&self) -> f32 {
        self.y
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmax(&self) -> f32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin().max(another.xmin());
        let r = self.xmax().min(another.xmax());
        let t = self.ymin().max(another.ymin());
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let inter = self.intersection_area(another);
        let union = self.area() + another.area() - inter;
        if union <= 0. {
            0.
        } else {
            inter / union
        }
    }
}

/// 单个检测结果, 只能由 DetectionDecoder 构造
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "box")]
    bbox: Bbox,
    label: String,
    confidence: f32,
}

impl Detection {
    pub(crate) fn new(bbox: Bbox, label: String, confidence: f32) -> Self {
        Self {
            bbox,
            label,
            confidence,
        }
    }

    pub fn bbox(&self) -> &Bbox {
        &self.bbox
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// 类别条目: id 为多类别分数矩阵中的列号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub id: usize,
    pub name: String,
}

/// 有序类别表 (部署时固定)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassCatalog {
    entries: Vec<ClassEntry>,
}

impl ClassCatalog {
    pub fn new(entries: Vec<ClassEntry>) -> Result<Self, ConfigError> {
        let catalog = Self { entries };
        catalog.validate()?;
        Ok(catalog)
    }

    /// 按顺序编号: id = 位置
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            entries: names
                .into_iter()
                .enumerate()
                .map(|(id, name)| ClassEntry {
                    id,
                    name: name.into(),
                })
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entries.is_empty() {
            return Err(ConfigError::Invalid("class catalog is empty".into()));
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "class id {} has an empty name",
                    entry.id
                )));
            }
            if !seen.insert(entry.id) {
                return Err(ConfigError::Invalid(format!(
                    "class id {} appears more than once",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ClassEntry> {
        self.entries.iter()
    }

    /// 按位置查找 (0-based)
    pub fn by_ordinal(&self, index: usize) -> Option<&ClassEntry> {
        self.entries.get(index)
    }

    pub fn max_id(&self) -> Option<usize> {
        self.entries.iter().map(|e| e.id).max()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl FromIterator<ClassEntry> for ClassCatalog {
    fn from_iter<I: IntoIterator<Item = ClassEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
