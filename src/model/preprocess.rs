//! Turns a decoded image into the pixel tensor the vision encoder expects,
//! following the image processor config shipped with the model

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;

/// Target size as it appears in `preprocessor_config.json`: either a single
/// edge length or an explicit height/width pair
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Size {
    Square(u32),
    Dims { height: u32, width: u32 },
}

impl Size {
    pub fn dims(&self) -> (u32, u32) {
        match *self {
            Size::Square(edge) => (edge, edge),
            Size::Dims { height, width } => (height, width),
        }
    }
}

/// The subset of the ViT image processor configuration used for inference
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub do_resize: bool,
    pub size: Size,

    /// PIL resampling filter id
    pub resample: u8,

    pub do_rescale: bool,
    pub rescale_factor: f64,

    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            do_resize: true,
            size: Size::Square(384),
            resample: 2,
            do_rescale: true,
            rescale_factor: 1. / 255.,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

impl ProcessorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open preprocessor config {path:?}"))?;
        serde_json::from_reader(file)
            .with_context(|| format!("failed to parse preprocessor config {path:?}"))
    }

    /// Map the PIL filter id onto the closest `image` filter
    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            3 => FilterType::CatmullRom,
            _ => FilterType::Triangle,
        }
    }

    /// Convert `image` into a `(1, 3, H, W)` f32 tensor on `device`
    pub fn preprocess(&self, image: &RgbImage, device: &Device) -> Result<Tensor> {
        let resized;
        let image = if self.do_resize {
            let (height, width) = self.size.dims();
            resized = imageops::resize(image, width, height, self.filter());
            &resized
        } else {
            image
        };

        let (width, height) = image.dimensions();
        let data = Tensor::from_vec(
            image.as_raw().clone(),
            (height as usize, width as usize, 3),
            &Device::Cpu,
        )?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;

        let data = if self.do_rescale {
            data.affine(self.rescale_factor, 0.)?
        } else {
            data
        };

        let data = if self.do_normalize {
            let mean = Tensor::new(&self.image_mean, &Device::Cpu)?.reshape((3, 1, 1))?;
            let std = Tensor::new(&self.image_std, &Device::Cpu)?.reshape((3, 1, 1))?;
            data.broadcast_sub(&mean)?.broadcast_div(&std)?
        } else {
            data
        };

        // Add a batch dimension
        Ok(data.unsqueeze(0)?.to_device(device)?)
    }
}
