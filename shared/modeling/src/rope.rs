use std::f32::consts::PI;

use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default, PartialEq)]
pub enum RoPEType {
    #[serde(rename = "llama3")]
    Llama3,
    #[default]
    #[serde(rename = "default")]
    Default,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct RoPEConfig {
    pub factor: Option<f32>,
    pub low_freq_factor: Option<f32>,
    pub high_freq_factor: Option<f32>,
    pub original_max_position_embeddings: Option<usize>,
    #[serde(alias = "type")]
    pub rope_type: RoPEType,
}

pub fn default_rope() -> f32 {
    10_000.0
}

fn calculate_default_inv_freq(head_dim: usize, rope_theta: f32) -> Vec<f32> {
    (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / rope_theta.powf(i as f32 / head_dim as f32))
        .collect()
}

#[derive(Debug)]
pub struct RoPECache {
    pub inv_freq: Tensor,
}

impl RoPECache {
    pub fn new(
        rope_config: &Option<RoPEConfig>,
        head_dim: usize,
        rope_theta: f32,
        device: &Device,
    ) -> Self {
        let inv_freq = calculate_default_inv_freq(head_dim, rope_theta);

        let inv_freq = match rope_config {
            None
            | Some(RoPEConfig {
                rope_type: RoPEType::Default,
                ..
            }) => Tensor::from_slice(&inv_freq).to(*device),
            Some(RoPEConfig {
                rope_type: RoPEType::Llama3,
                original_max_position_embeddings,
                factor,
                low_freq_factor,
                high_freq_factor,
            }) => {
                let original_max_position_embeddings =
                    original_max_position_embeddings.unwrap_or(8192) as f32;
                let factor = factor.unwrap_or(8.0);
                let low_freq_factor = low_freq_factor.unwrap_or(1.0);
                let high_freq_factor = high_freq_factor.unwrap_or(4.0);
                let low_freq_wavelen = original_max_position_embeddings / low_freq_factor;
                let high_freq_wavelen = original_max_position_embeddings / high_freq_factor;

                let inv_freq = inv_freq
                    .into_iter()
                    .map(|freq| {
                        let wavelen = 2. * PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / factor
                        } else {
                            let smooth = (original_max_position_embeddings / wavelen
                                - low_freq_factor)
                                / (high_freq_factor - low_freq_factor);
                            (1. - smooth) * freq / factor + smooth * freq
                        }
                    })
                    .collect::<Vec<_>>();

                Tensor::from_slice(&inv_freq).to(*device)
            }
        };

        Self { inv_freq }
    }

    pub fn apply_rotary_emb(&self, x: &Tensor, position_ids: Option<&Tensor>) -> Tensor {
        let (b_sz, _, seq_len, _) = x.size4().unwrap();
        let position_ids = match position_ids {
            Some(ids) => ids,
            None => {
                // Default sequential positions starting at 0.
                &Tensor::arange(seq_len, (Kind::Int64, x.device()))
                    .unsqueeze(0)
                    .expand([b_sz, seq_len], false)
            }
        };
        let pos_shape = position_ids.size();
        assert_eq!(
            pos_shape.len(),
            2,
            "position_ids must be 2D [batch, seq_len]"
        );
        let pos_b = pos_shape[0];
        assert_eq!(
            pos_shape[1], seq_len,
            "sequence length mismatch between x and position_ids"
        );
        assert!(
            pos_b == 1 || pos_b == b_sz,
            "batch size mismatch between position_ids and x"
        );

        let head_dim_2 = self.inv_freq.size()[0];
        let inv_freq_expanded = self
            .inv_freq
            .to_kind(Kind::Float)
            .unsqueeze(0)
            .unsqueeze(-1)
            .expand([pos_b, head_dim_2, 1], true);
        let position_ids_expanded = position_ids.to_kind(Kind::Float).unsqueeze(1);

        let freqs = inv_freq_expanded.matmul(&position_ids_expanded); // [pos_b, head_dim_2, seq_len]
        let freqs = freqs.transpose(1, 2);

        let emb = Tensor::cat(&[&freqs, &freqs], -1); // [pos_b, seq_len, head_dim]

        let cos = emb.cos().unsqueeze(1).to_kind(x.kind());
        let sin = emb.sin().unsqueeze(1).to_kind(x.kind());

        (x * &cos) + (rotate_half(x) * &sin)
    }
}

pub fn rotate_half(xs: &Tensor) -> Tensor {
    let last_dim = *xs.size().last().unwrap();
    let xs1 = xs.narrow(-1, 0, last_dim / 2);
    let xs2 = xs.narrow(-1, last_dim / 2, last_dim - last_dim / 2);
    Tensor::cat(&[&xs2.neg(), &xs1], -1)
}
