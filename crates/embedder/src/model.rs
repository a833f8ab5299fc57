//! ONNX embedding model.
//!
//! Loads a sentence-transformer style encoder (`model.onnx` +
//! `tokenizer.json`), runs the forward pass synchronously and reduces
//! token states to one vector per input by attention-masked mean
//! pooling followed by L2 normalisation.

use std::path::Path;

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use tokenizers::{PaddingParams, Tokenizer, TruncationDirection, TruncationParams, TruncationStrategy};
use tracing::{debug, info};

/// Token budget per input; longer texts are truncated by the tokenizer.
const MAX_SEQUENCE_LENGTH: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
  #[error("Failed to load tokenizer: {0}")]
  Tokenizer(String),
  #[error("Failed to load model: {0}")]
  Session(#[from] ort::Error),
  #[error("Model output has unexpected shape")]
  BadOutput,
  #[error("Model produced {got}-dimensional vectors, expected {expected}")]
  WrongDimension { expected: usize, got: usize },
}

pub struct EmbeddingModel {
  session: Session,
  tokenizer: Tokenizer,
  dim: usize,
}

impl EmbeddingModel {
  /// Load the model from a directory holding `model.onnx` and
  /// `tokenizer.json`.
  pub fn load(model_dir: &Path, dim: usize) -> Result<Self, ModelError> {
    info!(dir = %model_dir.display(), dim, "Loading embedding model");

    let mut tokenizer =
      Tokenizer::from_file(model_dir.join("tokenizer.json")).map_err(|e| ModelError::Tokenizer(e.to_string()))?;
    tokenizer
      .with_truncation(Some(TruncationParams {
        max_length: MAX_SEQUENCE_LENGTH,
        strategy: TruncationStrategy::LongestFirst,
        direction: TruncationDirection::Right,
        stride: 0,
      }))
      .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
    tokenizer.with_padding(Some(PaddingParams::default()));

    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .commit_from_file(model_dir.join("model.onnx"))?;

    debug!("Embedding model loaded");
    Ok(Self {
      session,
      tokenizer,
      dim,
    })
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  /// Embed a batch of already-prefixed texts.
  pub fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let encodings = self
      .tokenizer
      .encode_batch(texts.to_vec(), true)
      .map_err(|e| ModelError::Tokenizer(e.to_string()))?;

    let batch = encodings.len();
    let seq_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);

    let mut input_ids = Vec::with_capacity(batch * seq_len);
    let mut attention_mask = Vec::with_capacity(batch * seq_len);
    let mut token_type_ids = Vec::with_capacity(batch * seq_len);
    for encoding in &encodings {
      let ids = encoding.get_ids();
      let mask = encoding.get_attention_mask();
      let types = encoding.get_type_ids();
      for i in 0..seq_len {
        input_ids.push(*ids.get(i).unwrap_or(&0) as i64);
        attention_mask.push(*mask.get(i).unwrap_or(&0) as i64);
        token_type_ids.push(*types.get(i).unwrap_or(&0) as i64);
      }
    }

    let shape = [batch as i64, seq_len as i64];
    let outputs = self.session.run(ort::inputs![
      "input_ids" => Tensor::from_array((shape, input_ids))?,
      "attention_mask" => Tensor::from_array((shape, attention_mask.clone()))?,
      "token_type_ids" => Tensor::from_array((shape, token_type_ids))?,
    ])?;

    let (out_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    let dims: Vec<i64> = out_shape.to_vec();
    if dims.len() != 3 || dims[0] as usize != batch || dims[1] as usize != seq_len {
      return Err(ModelError::BadOutput);
    }
    let hidden = dims[2] as usize;
    if hidden != self.dim {
      return Err(ModelError::WrongDimension {
        expected: self.dim,
        got: hidden,
      });
    }

    Ok(mean_pool(data, &attention_mask, batch, seq_len, hidden))
  }
}

/// Attention-masked mean pooling plus L2 normalisation.
fn mean_pool(data: &[f32], attention_mask: &[i64], batch: usize, seq_len: usize, hidden: usize) -> Vec<Vec<f32>> {
  let mut vectors = Vec::with_capacity(batch);

  for b in 0..batch {
    let mut pooled = vec![0.0f32; hidden];
    let mut token_count = 0.0f32;

    for s in 0..seq_len {
      if attention_mask[b * seq_len + s] == 0 {
        continue;
      }
      token_count += 1.0;
      let base = (b * seq_len + s) * hidden;
      for (h, value) in pooled.iter_mut().enumerate() {
        *value += data[base + h];
      }
    }

    if token_count > 0.0 {
      for value in pooled.iter_mut() {
        *value /= token_count;
      }
    }

    let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
      for value in pooled.iter_mut() {
        *value /= norm;
      }
    }

    vectors.push(pooled);
  }

  vectors
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mean_pool_respects_attention_mask() {
    // batch=1, seq_len=3, hidden=2; last token is padding.
    let data = [1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
    let mask = [1, 1, 0];

    let vectors = mean_pool(&data, &mask, 1, 3, 2);
    assert_eq!(vectors.len(), 1);

    // Mean of [1,2] and [3,4] is [2,3]; padding is excluded.
    let expected_norm = (2.0f32 * 2.0 + 3.0 * 3.0).sqrt();
    assert!((vectors[0][0] - 2.0 / expected_norm).abs() < 1e-6);
    assert!((vectors[0][1] - 3.0 / expected_norm).abs() < 1e-6);
  }

  #[test]
  fn test_mean_pool_output_is_unit_length() {
    let data = [0.5, -1.5, 2.0, 0.25, 1.0, 1.0, -0.75, 0.5];
    let mask = [1, 1, 1, 1];

    let vectors = mean_pool(&data, &mask, 2, 2, 2);
    for vector in vectors {
      let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
      assert!((norm - 1.0).abs() < 1e-5, "vector must be L2-normalised, norm={norm}");
    }
  }

  #[test]
  fn test_mean_pool_all_padding_is_zero_vector() {
    let data = [1.0, 2.0];
    let mask = [0];
    let vectors = mean_pool(&data, &mask, 1, 1, 2);
    assert_eq!(vectors[0], vec![0.0, 0.0]);
  }

  #[test]
  fn test_load_missing_model_fails() {
    let err = EmbeddingModel::load(Path::new("/definitely/missing"), 768).unwrap_err();
    assert!(matches!(err, ModelError::Tokenizer(_)));
  }
}
