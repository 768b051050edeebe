/// 图像输入 (Image Input)
///
/// 上传的原始字节 → 解码 → 输入张量
pub mod preprocess;

pub use preprocess::{Image, ImagePreprocessor, InputEncoding, InputTensor};
