/// 检测结果 (Detection)
///
/// - types:   检测框 / 检测结果 / 类别表
/// - decoder: 原始输出张量 → 检测结果
pub mod decoder;
pub mod types;

pub use decoder::DetectionDecoder;
pub use types::{Bbox, ClassCatalog, ClassEntry, Detection};
