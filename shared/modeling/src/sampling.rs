use rand::{distr::weighted::WeightedIndex, distr::Distribution, SeedableRng};
use tch::{Kind, TchError, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("failed to read logits from tensor: {0}")]
    ReadLogits(#[from] TchError),

    #[error("all token probabilities are zero or non-finite")]
    DegenerateDistribution,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    ArgMax,
    All { temperature: f64 },
    TopP { p: f64, temperature: f64 },
}

/// Turns a vocab-sized logits tensor into a sampled token id.
///
/// Stateful: carries its own RNG so that repeated runs with the same seed
/// produce the same completions.
pub struct LogitsProcessor {
    rng: rand_chacha::ChaCha8Rng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        let rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        Self { rng, sampling }
    }

    pub fn new(seed: u64, temperature: Option<f64>, top_p: Option<f64>) -> Self {
        let temperature = temperature.and_then(|v| if v < 1e-7 { None } else { Some(v) });
        let sampling = match temperature {
            None => Sampling::ArgMax,
            Some(temperature) => match top_p {
                Some(p) if p < 1.0 => Sampling::TopP { p, temperature },
                _ => Sampling::All { temperature },
            },
        };
        Self::from_sampling(seed, sampling)
    }

    fn sample_argmax(&mut self, logits: &Tensor) -> i64 {
        logits.argmax(-1, false).int64_value(&[])
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> Result<i64, SamplingError> {
        let distr =
            WeightedIndex::new(probs).map_err(|_| SamplingError::DegenerateDistribution)?;
        Ok(distr.sample(&mut self.rng) as i64)
    }

    /// Nucleus sampling: sample from the smallest set of tokens whose
    /// cumulative probability exceeds `top_p`.
    fn sample_topp(&mut self, probs: &mut [f32], top_p: f32) -> Result<i64, SamplingError> {
        let mut argsort_indices: Vec<usize> = (0..probs.len()).collect();
        argsort_indices.sort_by(|&i, &j| probs[j].total_cmp(&probs[i]));

        let mut cumsum = 0.;
        for index in &argsort_indices {
            if cumsum >= top_p {
                probs[*index] = 0.0;
            } else {
                cumsum += probs[*index];
            }
        }

        self.sample_multinomial(probs)
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<i64, SamplingError> {
        let prs = |temperature: f64| -> Result<Vec<f32>, SamplingError> {
            let logits = logits.to_kind(Kind::Float) / temperature;
            let probs = logits.softmax(-1, Kind::Float);
            Ok(Vec::<f32>::try_from(&probs.contiguous().view(-1))?)
        };

        let next_token = match self.sampling.clone() {
            Sampling::ArgMax => self.sample_argmax(logits),
            Sampling::All { temperature } => {
                let probs = prs(temperature)?;
                self.sample_multinomial(&probs)?
            }
            Sampling::TopP { p, temperature } => {
                let mut probs = prs(temperature)?;
                if p <= 0.0 || p >= 1.0 {
                    // simply sample from the predicted probability distribution
                    self.sample_multinomial(&probs)?
                } else {
                    self.sample_topp(&mut probs, p as f32)?
                }
            }
        };
        Ok(next_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Tensor {
        Tensor::from_slice(&[0.1f32, 0.2, 3.0, 0.4])
    }

    #[test]
    fn argmax_picks_largest_logit() {
        let mut processor = LogitsProcessor::from_sampling(0, Sampling::ArgMax);
        assert_eq!(processor.sample(&logits()).unwrap(), 2);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut processor = LogitsProcessor::new(0, Some(0.0), Some(0.9));
        for _ in 0..8 {
            assert_eq!(processor.sample(&logits()).unwrap(), 2);
        }
    }

    #[test]
    fn same_seed_same_tokens() {
        let sampling = Sampling::TopP {
            p: 0.9,
            temperature: 1.0,
        };
        let mut a = LogitsProcessor::from_sampling(42, sampling.clone());
        let mut b = LogitsProcessor::from_sampling(42, sampling);
        let input = logits();
        for _ in 0..16 {
            assert_eq!(a.sample(&input).unwrap(), b.sample(&input).unwrap());
        }
    }

    #[test]
    fn tiny_top_p_collapses_to_max() {
        let mut processor = LogitsProcessor::from_sampling(
            7,
            Sampling::TopP {
                p: 1e-6,
                temperature: 1.0,
            },
        );
        let input = Tensor::from_slice(&[-5.0f32, 10.0, -5.0]);
        for _ in 0..8 {
            assert_eq!(processor.sample(&input).unwrap(), 1);
        }
    }
}
