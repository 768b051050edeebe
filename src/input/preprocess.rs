// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 图片解码与预处理
// 原始字节 → RGB 图片 → [1, H, W, 3] 张量 (像素值原样保留, 不做归一化)

use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use ndarray::Array4;
use tracing::debug;

use crate::error::DecodeError;

/// 缩放后的最大像素数 (约 64MP, RGB 约 192MB)
pub const MAX_PIXELS: u64 = 64 * 1024 * 1024;

/// 模型期望的输入元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputEncoding {
    /// 0-255 的 uint8 (TF Object Detection 导出的默认格式)
    #[default]
    U8,
    /// 同样是 0-255 的像素值, 只是以 f32 存储
    F32,
}

impl InputEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            InputEncoding::U8 => "uint8",
            InputEncoding::F32 => "float32",
        }
    }
}

/// NHWC 输入张量, batch 固定为 1
#[derive(Debug, Clone, PartialEq)]
pub enum InputTensor {
    U8(Array4<u8>),
    F32(Array4<f32>),
}

impl InputTensor {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            InputTensor::U8(xs) => xs.shape().to_vec(),
            InputTensor::F32(xs) => xs.shape().to_vec(),
        }
    }

    pub fn encoding(&self) -> InputEncoding {
        match self {
            InputTensor::U8(_) => InputEncoding::U8,
            InputTensor::F32(_) => InputEncoding::F32,
        }
    }
}

/// 解码后的图片
#[derive(Debug, Clone)]
pub struct Image {
    rgb: RgbImage,
    format: ImageFormat,
    original: (u32, u32),
}

impl Image {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// 缩放前的原始尺寸
    pub fn original_size(&self) -> (u32, u32) {
        self.original
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }
}

/// 图片预处理器
#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    display_width: Option<u32>,
    encoding: InputEncoding,
}

impl ImagePreprocessor {
    pub fn new(display_width: Option<u32>, encoding: InputEncoding) -> Self {
        Self {
            display_width: display_width.filter(|&w| w > 0),
            encoding,
        }
    }

    pub fn encoding(&self) -> InputEncoding {
        self.encoding
    }

    /// 解码图片; 设置了显示宽度时按比例缩放到该宽度
    pub fn decode(&self, bytes: &[u8]) -> Result<Image, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;

        let img = image::load_from_memory_with_format(bytes, format)
            .map_err(|source| DecodeError::Corrupt { format, source })?;

        let (w0, h0) = img.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(DecodeError::ZeroSized {
                width: w0,
                height: h0,
            });
        }
        debug!("图片解码完成: {:?} {}x{}", format, w0, h0);

        let img = match self.display_width {
            Some(w) if w != w0 => self.scale_to_width(&img, w)?,
            _ => img,
        };

        Ok(Image {
            rgb: img.to_rgb8(),
            format,
            original: (w0, h0),
        })
    }

    fn scale_to_width(&self, img: &DynamicImage, w: u32) -> Result<DynamicImage, DecodeError> {
        let (w0, h0) = img.dimensions();
        let h = ((h0 as f64) * (w as f64) / (w0 as f64)).round().max(1.0);
        // 极端长宽比的图片缩放后尺寸会失控, 分配前拒绝
        if h * (w as f64) > MAX_PIXELS as f64 {
            return Err(DecodeError::TooLarge {
                width: w,
                height: h.min(u32::MAX as f64) as u32,
                max_pixels: MAX_PIXELS,
            });
        }
        Ok(img.resize_exact(w, h as u32, image::imageops::FilterType::Triangle))
    }

    /// 图片 → [1, H, W, 3]
    pub fn to_tensor(&self, image: &Image) -> InputTensor {
        let rgb = &image.rgb;
        let shape = (1, rgb.height() as usize, rgb.width() as usize, 3);
        let pixel = |y: usize, x: usize, c: usize| rgb.get_pixel(x as u32, y as u32).0[c];
        match self.encoding {
            InputEncoding::U8 => {
                InputTensor::U8(Array4::from_shape_fn(shape, |(_, y, x, c)| pixel(y, x, c)))
            }
            InputEncoding::F32 => InputTensor::F32(Array4::from_shape_fn(shape, |(_, y, x, c)| {
                pixel(y, x, c) as f32
            })),
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample() -> RgbImage {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 10]));
        img.put_pixel(3, 1, Rgb([1, 2, 3]));
        img
    }

    #[test]
    fn test_decode_png() {
        let pre = ImagePreprocessor::default();
        let image = pre.decode(&encode_png(&sample())).unwrap();
        assert_eq!((image.width(), image.height()), (4, 2));
        assert_eq!(image.format(), ImageFormat::Png);
        assert_eq!(image.rgb().get_pixel(3, 1), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let pre = ImagePreprocessor::default();
        assert!(matches!(pre.decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(
            pre.decode(b"definitely not an image"),
            Err(DecodeError::UnsupportedFormat)
        ));

        // PNG 头 + 截断的数据
        let mut truncated = encode_png(&sample());
        truncated.truncate(20);
        assert!(matches!(
            pre.decode(&truncated),
            Err(DecodeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_to_tensor_keeps_raw_pixels() {
        let pre = ImagePreprocessor::default();
        let image = pre.decode(&encode_png(&sample())).unwrap();
        match pre.to_tensor(&image) {
            InputTensor::U8(xs) => {
                assert_eq!(xs.shape(), &[1, 2, 4, 3]);
                assert_eq!(xs[[0, 0, 0, 0]], 255);
                assert_eq!(xs[[0, 0, 0, 2]], 10);
                assert_eq!(xs[[0, 1, 3, 1]], 2);
            }
            other => panic!("unexpected tensor {:?}", other.encoding()),
        }

        let pre = ImagePreprocessor::new(None, InputEncoding::F32);
        match pre.to_tensor(&image) {
            InputTensor::F32(xs) => assert_eq!(xs[[0, 0, 0, 0]], 255.0),
            other => panic!("unexpected tensor {:?}", other.encoding()),
        }
    }

    #[test]
    fn test_display_width_rejects_extreme_aspect() {
        // 1x60000 的细长图片放大到 1000 宽会变成 1000x60000000
        let img = RgbImage::from_pixel(1, 60_000, Rgb([7, 7, 7]));
        let pre = ImagePreprocessor::new(Some(1000), InputEncoding::U8);
        match pre.decode(&encode_png(&img)) {
            Err(DecodeError::TooLarge { width, height, .. }) => {
                assert_eq!((width, height), (1000, 60_000_000));
            }
            other => panic!("unexpected result {:?}", other.map(|i| i.original_size())),
        }

        // 不缩放时照常解码
        let image = ImagePreprocessor::default().decode(&encode_png(&img)).unwrap();
        assert_eq!((image.width(), image.height()), (1, 60_000));
    }

    #[test]
    fn test_display_width_scales_keeping_aspect() {
        let img = RgbImage::from_pixel(200, 100, Rgb([7, 7, 7]));
        let pre = ImagePreprocessor::new(Some(1000), InputEncoding::U8);
        let image = pre.decode(&encode_png(&img)).unwrap();
        assert_eq!((image.width(), image.height()), (1000, 500));
        assert_eq!(image.original_size(), (200, 100));
        assert_eq!(pre.to_tensor(&image).shape(), vec![1, 500, 1000, 3]);
    }
}
