use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use trytune_core::{DType, ModuleSpec, PortSpec, Shape, Tensor, TensorMap};

use crate::f32_port;

fn take(inputs: &mut TensorMap, port: &str) -> Result<Tensor> {
    inputs
        .remove(port)
        .with_context(|| format!("missing input {port}"))
}

fn single(name: &str, tensor: Tensor) -> TensorMap {
    let mut out = TensorMap::new();
    out.insert(name.to_string(), tensor);
    out
}

fn default_datatype() -> String {
    "FP32".to_string()
}

fn dynamic_vector() -> Vec<i64> {
    vec![-1]
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityArgs {
    #[serde(default = "default_datatype")]
    pub datatype: String,
    #[serde(default = "dynamic_vector")]
    pub shape: Vec<i64>,
    #[serde(default)]
    pub max_batch_size: usize,
}

impl IdentityArgs {
    pub(crate) fn build(self) -> Result<Identity> {
        let dtype: DType = self.datatype.parse()?;
        ensure!(
            self.shape.iter().all(|d| *d >= -1),
            "invalid identity shape {:?}",
            self.shape
        );
        Ok(Identity {
            dtype,
            dims: self.shape,
            max_batch: self.max_batch_size,
        })
    }
}

pub(crate) struct Identity {
    dtype: DType,
    dims: Vec<i64>,
    max_batch: usize,
}

impl Identity {
    pub(crate) fn spec(&self) -> ModuleSpec {
        ModuleSpec {
            inputs: vec![PortSpec::from_wire("x", self.dtype, &self.dims)],
            outputs: vec![PortSpec::from_wire("y", self.dtype, &self.dims)],
            max_batch: self.max_batch,
        }
    }

    pub(crate) fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        Ok(single("y", take(&mut inputs, "x")?))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NormalizeArgs {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    #[serde(default)]
    pub max_batch_size: usize,
}

impl NormalizeArgs {
    pub(crate) fn build(self) -> Result<Normalize> {
        ensure!(!self.mean.is_empty(), "normalize needs at least one channel");
        ensure!(
            self.mean.len() == self.std.len(),
            "mean has {} channels but std has {}",
            self.mean.len(),
            self.std.len()
        );
        ensure!(self.std.iter().all(|s| *s != 0.0), "std must be non-zero");
        Ok(Normalize {
            mean: self.mean,
            std: self.std,
            max_batch: self.max_batch_size,
        })
    }
}

pub(crate) struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
    max_batch: usize,
}

impl Normalize {
    pub(crate) fn spec(&self) -> ModuleSpec {
        let dims = [-1, self.mean.len() as i64, -1, -1];
        ModuleSpec {
            inputs: vec![f32_port("IMAGE", &dims)],
            outputs: vec![f32_port("NORMALIZED", &dims)],
            max_batch: self.max_batch,
        }
    }

    pub(crate) fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let image = take(&mut inputs, "IMAGE")?;
        let dims = image.shape().dims();
        ensure!(dims.len() == 4, "IMAGE must be NCHW, got {}", image.shape());
        let plane = dims[2] * dims[3];
        let channels = self.mean.len();

        let mut values = image.to_f32()?;
        for (idx, v) in values.iter_mut().enumerate() {
            let c = (idx / plane) % channels;
            *v = (*v - self.mean[c]) / self.std[c];
        }
        Ok(single(
            "NORMALIZED",
            Tensor::from_f32(image.shape().clone(), &values)?,
        ))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SoftmaxArgs {
    pub classes: Option<usize>,
    #[serde(default)]
    pub max_batch_size: usize,
}

impl SoftmaxArgs {
    pub(crate) fn build(self) -> Softmax {
        Softmax {
            classes: self.classes,
            max_batch: self.max_batch_size,
        }
    }
}

pub(crate) struct Softmax {
    classes: Option<usize>,
    max_batch: usize,
}

impl Softmax {
    pub(crate) fn spec(&self) -> ModuleSpec {
        let dims = [-1, self.classes.map(|c| c as i64).unwrap_or(-1)];
        ModuleSpec {
            inputs: vec![f32_port("LOGITS", &dims)],
            outputs: vec![f32_port("PROBS", &dims)],
            max_batch: self.max_batch,
        }
    }

    pub(crate) fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let logits = take(&mut inputs, "LOGITS")?;
        let width = logits.shape().dims().last().copied().unwrap_or(1);
        let mut values = logits.to_f32()?;

        if width > 0 {
            for row in values.chunks_mut(width) {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in row.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        }
        Ok(single(
            "PROBS",
            Tensor::from_f32(logits.shape().clone(), &values)?,
        ))
    }
}

fn default_threshold() -> f32 {
    0.5
}

#[derive(Clone, Debug, Deserialize)]
pub struct CropArgs {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Keep only detections of this class; all classes when absent.
    pub label: Option<i64>,
}

impl CropArgs {
    pub(crate) fn build(self) -> Crop {
        Crop {
            threshold: self.threshold,
            label: self.label,
        }
    }
}

/// Cuts detection boxes out of a single NCHW image. Crops are zero padded to
/// the largest kept box and returned with their true widths and heights.
pub(crate) struct Crop {
    threshold: f32,
    label: Option<i64>,
}

struct Region {
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
}

impl Crop {
    pub(crate) fn spec() -> ModuleSpec {
        ModuleSpec {
            inputs: vec![
                f32_port("IMAGE", &[1, 3, -1, -1]),
                f32_port("BOXES", &[-1, 4]),
                PortSpec::from_wire("LABELS", DType::I64, &[-1]),
                f32_port("SCORES", &[-1]),
            ],
            outputs: vec![
                f32_port("CROPPED_IMAGES", &[-1, 3, -1, -1]),
                PortSpec::from_wire("WHS", DType::I64, &[-1, 2]),
            ],
            max_batch: 0,
        }
    }

    pub(crate) fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let image = take(&mut inputs, "IMAGE")?;
        let boxes = take(&mut inputs, "BOXES")?.to_f32()?;
        let labels = take(&mut inputs, "LABELS")?.to_i64()?;
        let scores = take(&mut inputs, "SCORES")?.to_f32()?;

        let count = scores.len();
        ensure!(
            boxes.len() == count * 4 && labels.len() == count,
            "BOXES, LABELS and SCORES disagree on detection count"
        );

        let dims = image.shape().dims();
        let (channels, height, width) = match dims {
            [1, c, h, w] => (*c, *h, *w),
            _ => bail!("IMAGE must have shape [1, C, H, W], got {}", image.shape()),
        };
        let pixels = image.to_f32()?;

        let regions: Vec<Region> = (0..count)
            .filter(|i| scores[*i] >= self.threshold)
            .filter(|i| self.label.map_or(true, |l| labels[*i] == l))
            .filter_map(|i| {
                let b = &boxes[i * 4..i * 4 + 4];
                let x0 = b[0].floor().clamp(0.0, width as f32) as usize;
                let y0 = b[1].floor().clamp(0.0, height as f32) as usize;
                let x1 = b[2].ceil().clamp(0.0, width as f32) as usize;
                let y1 = b[3].ceil().clamp(0.0, height as f32) as usize;
                (x1 > x0 && y1 > y0).then(|| Region {
                    x0,
                    y0,
                    w: x1 - x0,
                    h: y1 - y0,
                })
            })
            .collect();

        let max_w = regions.iter().map(|r| r.w).max().unwrap_or(0);
        let max_h = regions.iter().map(|r| r.h).max().unwrap_or(0);
        let crop_len = channels * max_h * max_w;

        let mut crops = vec![0.0f32; regions.len() * crop_len];
        let mut whs = Vec::with_capacity(regions.len() * 2);
        for (n, region) in regions.iter().enumerate() {
            for c in 0..channels {
                for y in 0..region.h {
                    let src = c * height * width + (region.y0 + y) * width + region.x0;
                    let dst = n * crop_len + c * max_h * max_w + y * max_w;
                    crops[dst..dst + region.w].copy_from_slice(&pixels[src..src + region.w]);
                }
            }
            whs.push(region.w as i64);
            whs.push(region.h as i64);
        }

        let mut out = TensorMap::new();
        out.insert(
            "CROPPED_IMAGES".to_string(),
            Tensor::from_f32(
                Shape::from_slice(&[regions.len(), channels, max_h, max_w]),
                &crops,
            )?,
        );
        out.insert(
            "WHS".to_string(),
            Tensor::from_i64(Shape::from_slice(&[regions.len(), 2]), &whs)?,
        );
        Ok(out)
    }
}
