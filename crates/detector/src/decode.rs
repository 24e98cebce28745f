//! Anchor-free output decoding
//!
//! Supports the two YOLO-family output layouts:
//! 1. a single concatenated `[84, N]` tensor (4 box values + 80 class
//!    scores per anchor), and
//! 2. three per-stride branches carrying box distributions (DFL, 16 bins
//!    per side), class scores and an optional score-sum prefilter channel.
//!
//! Quantized (int8) branches are pre-screened in quantized space so the
//! score-sum fast reject costs no per-cell float math.

use visionguard_common::BBox;

/// Bins per box side in the DFL head
pub const DFL_BINS: usize = 16;

/// Affine quantization parameters: `f = (q - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    #[must_use]
    #[inline]
    pub fn dequantize(&self, q: i8) -> f32 {
        (i32::from(q) - self.zero_point) as f32 * self.scale
    }

    /// Inverse mapping, used to move a float threshold into quantized space
    /// once per tensor instead of dequantizing every cell.
    #[must_use]
    #[inline]
    pub fn quantize(&self, f: f32) -> i32 {
        (f / self.scale).round() as i32 + self.zero_point
    }
}

/// Raw model output data, float or quantized int8.
#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
    Float(&'a [f32]),
    Quantized { data: &'a [i8], params: QuantParams },
}

impl TensorData<'_> {
    #[must_use]
    #[inline]
    fn value(&self, index: usize) -> f32 {
        match self {
            TensorData::Float(data) => data[index],
            TensorData::Quantized { data, params } => params.dequantize(data[index]),
        }
    }

    #[must_use]
    fn len(&self) -> usize {
        match self {
            TensorData::Float(data) => data.len(),
            TensorData::Quantized { data, .. } => data.len(),
        }
    }
}

/// One decode candidate in model-input coordinates.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bbox: BBox,
    pub class_id: u8,
    pub confidence: f32,
}

/// Softmax expectation over DFL bins: the decoded distance in stride units.
#[must_use]
pub fn dfl_expectation(bins: &[f32]) -> f32 {
    let max = bins.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    let mut expectation = 0.0f32;
    for (bin, &logit) in bins.iter().enumerate() {
        let weight = (logit - max).exp();
        sum += weight;
        expectation += bin as f32 * weight;
    }
    if sum > 0.0 {
        expectation / sum
    } else {
        0.0
    }
}

/// Decode the single concatenated `[84, N]` layout (leading batch dimension
/// tolerated). The first four features are `[cx, cy, w, h]` in model-input
/// pixels; the rest are per-class scores.
pub fn decode_combined(
    shape: &[usize],
    data: &TensorData,
    confidence_threshold: f32,
) -> Result<Vec<Candidate>, String> {
    if shape.len() < 2 {
        return Err(format!("expected >=2D output tensor, got {}D", shape.len()));
    }
    let num_features = shape[shape.len() - 2];
    let num_anchors = shape[shape.len() - 1];
    if num_features < 5 {
        return Err(format!("combined layout needs >=5 features, got {num_features}"));
    }
    if data.len() < num_features * num_anchors {
        return Err("output tensor shorter than its shape".to_string());
    }
    let num_classes = num_features - 4;

    // Layout is feature-major: feature f of anchor a sits at f * N + a.
    let mut candidates = Vec::with_capacity(num_anchors / 10);
    for anchor in 0..num_anchors {
        let feature = |f: usize| data.value(f * num_anchors + anchor);

        let mut max_score = 0.0f32;
        let mut max_class = 0usize;
        for class_id in 0..num_classes {
            let score = feature(4 + class_id);
            if score > max_score {
                max_score = score;
                max_class = class_id;
            }
        }
        if max_score < confidence_threshold {
            continue;
        }

        let cx = feature(0);
        let cy = feature(1);
        let width = feature(2);
        let height = feature(3);
        candidates.push(Candidate {
            bbox: BBox::new(cx - width / 2.0, cy - height / 2.0, width, height),
            class_id: max_class as u8,
            confidence: max_score,
        });
    }
    Ok(candidates)
}

/// One per-stride output branch of the DFL layout.
pub struct ScaleBranch<'a> {
    /// Grid stride in model-input pixels (8, 16 or 32 for a 640 input)
    pub stride: usize,
    /// Tensor shape, `[C, H, W]` with an optional leading batch dimension
    pub shape: &'a [usize],
    pub data: TensorData<'a>,
    /// Whether the last channel is a score-sum prefilter
    pub has_score_sum: bool,
}

/// Decode three-scale DFL branches into model-space candidates.
pub fn decode_dfl_branches(
    branches: &[ScaleBranch],
    confidence_threshold: f32,
) -> Result<Vec<Candidate>, String> {
    let mut candidates = Vec::with_capacity(64);
    for branch in branches {
        decode_dfl_branch(branch, confidence_threshold, &mut candidates)?;
    }
    Ok(candidates)
}

fn decode_dfl_branch(
    branch: &ScaleBranch,
    confidence_threshold: f32,
    out: &mut Vec<Candidate>,
) -> Result<(), String> {
    let shape = branch.shape;
    if shape.len() < 3 {
        return Err(format!("expected >=3D branch tensor, got {}D", shape.len()));
    }
    let channels = shape[shape.len() - 3];
    let grid_height = shape[shape.len() - 2];
    let grid_width = shape[shape.len() - 1];

    let box_channels = 4 * DFL_BINS;
    let extra = usize::from(branch.has_score_sum);
    if channels <= box_channels + extra {
        return Err(format!(
            "branch has {channels} channels, need more than {}",
            box_channels + extra
        ));
    }
    let num_classes = channels - box_channels - extra;
    let plane = grid_height * grid_width;
    if branch.data.len() < channels * plane {
        return Err("branch tensor shorter than its shape".to_string());
    }

    // Score-sum threshold moved into quantized space once per branch.
    let quantized_threshold = match branch.data {
        TensorData::Quantized { params, .. } if branch.has_score_sum => {
            Some(params.quantize(confidence_threshold))
        }
        _ => None,
    };

    let mut bins = [0.0f32; DFL_BINS];
    for row in 0..grid_height {
        for col in 0..grid_width {
            let cell = row * grid_width + col;
            let channel_value = |c: usize| branch.data.value(c * plane + cell);

            // Fast reject on the score-sum channel before the class scan.
            if branch.has_score_sum {
                let score_sum_channel = channels - 1;
                match (&branch.data, quantized_threshold) {
                    (TensorData::Quantized { data, .. }, Some(threshold)) => {
                        let raw = i32::from(data[score_sum_channel * plane + cell]);
                        if raw < threshold {
                            continue;
                        }
                    }
                    _ => {
                        if channel_value(score_sum_channel) < confidence_threshold {
                            continue;
                        }
                    }
                }
            }

            let mut max_score = 0.0f32;
            let mut max_class = 0usize;
            for class_id in 0..num_classes {
                let score = channel_value(box_channels + class_id);
                if score > max_score {
                    max_score = score;
                    max_class = class_id;
                }
            }
            if max_score < confidence_threshold {
                continue;
            }

            // DFL: each side is the expectation over its 16-bin distribution,
            // in stride units.
            let mut distances = [0.0f32; 4];
            for (side, distance) in distances.iter_mut().enumerate() {
                for (bin, slot) in bins.iter_mut().enumerate() {
                    *slot = channel_value(side * DFL_BINS + bin);
                }
                *distance = dfl_expectation(&bins);
            }
            let [dl, dt, dr, db] = distances;

            let stride = branch.stride as f32;
            let x1 = (col as f32 + 0.5 - dl) * stride;
            let y1 = (row as f32 + 0.5 - dt) * stride;
            let x2 = (col as f32 + 0.5 + dr) * stride;
            let y2 = (row as f32 + 0.5 + db) * stride;

            out.push(Candidate {
                bbox: BBox::from_corners(x1, y1, x2, y2),
                class_id: max_class as u8,
                confidence: max_score,
            });
        }
    }
    Ok(())
}

/// Class-wise greedy non-maximum suppression.
#[must_use]
pub fn nms_per_class(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::with_capacity(candidates.len());
    while !candidates.is_empty() {
        let current = candidates.swap_remove(0);
        candidates.retain(|candidate| {
            candidate.class_id != current.class_id
                || candidate.bbox.iou(&current.bbox) < iou_threshold
        });
        keep.push(current);
    }
    keep
}
