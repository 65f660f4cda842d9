use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: nn::Path, size: i64, eps: f64) -> Self {
        let weight = vs.ones("weight", &[size]);
        Self { weight, eps }
    }
}

impl Module for RMSNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        // Normalize in f32 regardless of the input kind.
        let kind = xs.kind();
        let xs = xs.to_kind(Kind::Float);
        let variance = xs.pow_tensor_scalar(2).mean_dim(-1, true, Kind::Float);
        let xs_normed = xs * (variance + self.eps).rsqrt();
        &self.weight * xs_normed.to_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind};

    #[test]
    fn preserves_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = RMSNorm::new(vs.root(), 4, 1e-5);
        let xs = Tensor::randn([2, 3, 4], (Kind::Float, Device::Cpu));
        let out = norm.forward(&xs);
        assert_eq!(out.size(), vec![2, 3, 4]);
    }

    #[test]
    fn unit_weight_normalizes_rows() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = RMSNorm::new(vs.root(), 8, 1e-6);
        let xs = Tensor::randn([1, 1, 8], (Kind::Float, Device::Cpu)) * 10.0;
        let out = norm.forward(&xs);
        // After RMS normalization the mean square of a row is ~1.
        let ms = out
            .pow_tensor_scalar(2)
            .mean_dim(-1, false, Kind::Float)
            .double_value(&[0, 0]);
        assert!((ms - 1.0).abs() < 1e-3, "mean square was {ms}");
    }
}
