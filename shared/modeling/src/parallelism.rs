use std::sync::Arc;

use tch::{
    nn::{self, Module},
    TchError, Tensor,
};
use thiserror::Error;

#[cfg(feature = "parallelism")]
use tch::{CStore, CNCCL};

/// Rank/world-size pair read from the launcher's environment.
///
/// One process runs per accelerator; the launcher (torchrun-style) exports
/// `LOCAL_RANK` and `WORLD_SIZE`. Absent variables mean a plain single-process
/// run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedEnv {
    pub local_rank: usize,
    pub world_size: usize,
}

#[derive(Debug, Error)]
pub enum DistributedEnvError {
    #[error("invalid {name} value {value:?}: expected a non-negative integer")]
    InvalidVar { name: &'static str, value: String },

    #[error("LOCAL_RANK {local_rank} out of range for WORLD_SIZE {world_size}")]
    RankOutOfRange { local_rank: usize, world_size: usize },
}

impl DistributedEnv {
    pub fn from_env() -> Result<Self, DistributedEnvError> {
        let local_rank = Self::read_var("LOCAL_RANK", 0)?;
        let world_size = Self::read_var("WORLD_SIZE", 1)?;
        if local_rank >= world_size {
            return Err(DistributedEnvError::RankOutOfRange {
                local_rank,
                world_size,
            });
        }
        Ok(Self {
            local_rank,
            world_size,
        })
    }

    fn read_var(name: &'static str, default: usize) -> Result<usize, DistributedEnvError> {
        match std::env::var(name) {
            Ok(value) => value
                .parse::<usize>()
                .map_err(|_| DistributedEnvError::InvalidVar { name, value }),
            Err(_) => Ok(default),
        }
    }

    /// Only the lowest rank logs and writes output files.
    pub fn is_main(&self) -> bool {
        self.local_rank == 0
    }
}

#[derive(Debug)]
pub enum Communicator {
    None,
    #[cfg(feature = "parallelism")]
    NCCL(CNCCL),
}

unsafe impl Send for Communicator {}

#[cfg(feature = "parallelism")]
impl From<CNCCL> for Communicator {
    fn from(value: CNCCL) -> Self {
        Self::NCCL(value)
    }
}

impl Communicator {
    pub fn size(&self) -> i64 {
        match self {
            Communicator::None => unimplemented!(),
            #[cfg(feature = "parallelism")]
            Communicator::NCCL(cnccl) => cnccl.size(),
        }
    }

    #[allow(unused_variables)]
    pub fn copy_to_model_parallel_region(&self, tensor: &Tensor) -> Result<Tensor, TchError> {
        match self {
            Communicator::None => unimplemented!(),
            #[cfg(feature = "parallelism")]
            Communicator::NCCL(cnccl) => cnccl.copy_to_model_parallel(tensor),
        }
    }

    #[allow(unused_variables)]
    pub fn reduce_from_model_parallel_region(&self, tensor: &Tensor) -> Result<Tensor, TchError> {
        match self {
            Communicator::None => unimplemented!(),
            #[cfg(feature = "parallelism")]
            Communicator::NCCL(cnccl) => cnccl.reduce_from_model_parallel(tensor),
        }
    }

    #[allow(unused_variables)]
    pub fn scatter_to_model_parallel_region(&self, tensor: &Tensor) -> Result<Tensor, TchError> {
        match self {
            Communicator::None => unimplemented!(),
            #[cfg(feature = "parallelism")]
            Communicator::NCCL(cnccl) => cnccl.scatter_to_model_parallel(tensor),
        }
    }

    #[allow(unused_variables)]
    pub fn gather_from_model_parallel_region(&self, tensor: &Tensor) -> Result<Tensor, TchError> {
        match self {
            Communicator::None => unimplemented!(),
            #[cfg(feature = "parallelism")]
            Communicator::NCCL(cnccl) => cnccl.gather_from_model_parallel(tensor),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CommunicatorId {
    None,
    #[cfg(feature = "parallelism")]
    NCCL(Arc<CStore>),
}

#[cfg(feature = "parallelism")]
impl From<CStore> for CommunicatorId {
    fn from(value: CStore) -> Self {
        Self::NCCL(Arc::new(value))
    }
}

pub trait ModelParallelRegion {
    fn copy_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn reduce_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn scatter_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn gather_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
}

impl ModelParallelRegion for Tensor {
    fn copy_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.copy_to_model_parallel_region(self).unwrap(),
            None => self.shallow_clone(),
        }
    }

    fn reduce_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.reduce_from_model_parallel_region(self).unwrap(),
            None => self.shallow_clone(),
        }
    }

    fn scatter_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.scatter_to_model_parallel_region(self).unwrap(),
            None => self.shallow_clone(),
        }
    }

    fn gather_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.gather_from_model_parallel_region(self).unwrap(),
            None => self.shallow_clone(),
        }
    }
}

/// Linear layer sharded along the output dimension. Each rank holds
/// `out_features / world_size` rows; checkpoint shards are expected to be
/// pre-sliced the same way.
#[derive(Debug)]
pub struct ColumnParallelLinear {
    pub(crate) linear: nn::Linear,
    comm: Option<Arc<Communicator>>,
    gather_output: bool,
}

impl ColumnParallelLinear {
    pub fn new(
        vs: nn::Path,
        in_features: i64,
        out_features: i64,
        bias: bool,
        gather_output: bool,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let world_size = comm.as_ref().map(|c| c.size()).unwrap_or(1);
        assert_eq!(
            out_features % world_size,
            0,
            "out_features must be divisible by world_size"
        );

        let linear = nn::linear(
            &vs,
            in_features,
            out_features / world_size,
            nn::LinearConfig {
                bias,
                ..Default::default()
            },
        );

        Self {
            linear,
            comm,
            gather_output,
        }
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, input: &Tensor) -> Tensor {
        match &self.comm {
            Some(_) => {
                let input_parallel = input.copy_to_model_parallel_region(&self.comm).contiguous();
                let output_parallel = self.linear.forward(&input_parallel);

                if self.gather_output {
                    output_parallel.gather_from_model_parallel_region(&self.comm)
                } else {
                    output_parallel
                }
            }
            None => self.linear.forward(input),
        }
    }
}

unsafe impl Send for ColumnParallelLinear {}

/// Linear layer sharded along the input dimension; the partial products are
/// all-reduced across ranks.
#[derive(Debug)]
pub struct RowParallelLinear {
    pub(crate) linear: nn::Linear,
    comm: Option<Arc<Communicator>>,
    input_is_parallel: bool,
}

impl RowParallelLinear {
    pub fn new(
        vs: nn::Path,
        in_features: i64,
        out_features: i64,
        bias: bool,
        input_is_parallel: bool,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let world_size = comm.as_ref().map(|c| c.size()).unwrap_or(1);
        assert_eq!(
            in_features % world_size,
            0,
            "in_features must be divisible by world_size"
        );

        let linear = nn::linear(
            &vs,
            in_features / world_size,
            out_features,
            nn::LinearConfig {
                bias,
                ..Default::default()
            },
        );

        Self {
            linear,
            comm,
            input_is_parallel,
        }
    }
}

impl Module for RowParallelLinear {
    fn forward(&self, input: &Tensor) -> Tensor {
        match &self.comm {
            Some(_) => {
                let input_parallel = if self.input_is_parallel {
                    input.shallow_clone()
                } else {
                    input.scatter_to_model_parallel_region(&self.comm)
                };

                let output_parallel = self.linear.forward(&input_parallel);

                output_parallel.reduce_from_model_parallel_region(&self.comm)
            }
            None => self.linear.forward(input),
        }
    }
}

unsafe impl Send for RowParallelLinear {}
