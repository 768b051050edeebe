/// 结果输出 (Output)
///
/// 在显示图片上绘制检测框
pub mod draw;

pub use draw::{annotate, color_palette};
