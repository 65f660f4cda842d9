use std::{fmt, str::FromStr};

use itertools::Itertools;
use tch::{utils::has_mps, Device};
use thiserror::Error;

fn get_cuda_devices() -> Vec<usize> {
    (0..tch::Cuda::device_count() as usize).collect()
}

/// Get the optimal devices for the current platform: MPS on macOS if
/// available, CUDA if available, CPU as fallback.
pub fn get_optimal_devices() -> Devices {
    #[cfg(target_os = "macos")]
    {
        if has_mps() {
            return Devices::Mps;
        }
    }

    let cuda_device_indices = get_cuda_devices();

    if !cuda_device_indices.is_empty() {
        return Devices::Cuda(cuda_device_indices);
    }

    Devices::Cpu
}

#[derive(Clone, Debug, PartialEq)]
pub enum Devices {
    Cpu,
    Mps,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Mps => write!(f, "MPS"),
            Devices::Cuda(device_ids) => {
                write!(
                    f,
                    "CUDA({})",
                    device_ids.iter().map(|id| id.to_string()).join(", ")
                )
            }
        }
    }
}

impl Devices {
    /// The number of unique usable devices. CPU & MPS count as one.
    pub fn size(&self) -> usize {
        match self {
            Devices::Cpu => 1,
            Devices::Mps => 1,
            Devices::Cuda(device_indices) => device_indices.len(),
        }
    }

    /// Device that process rank `n` pins itself to.
    pub fn device_for_rank(&self, n: usize) -> Option<Device> {
        match self {
            Devices::Cpu if n == 0 => Some(Device::Cpu),
            Devices::Mps if n == 0 => Some(Device::Mps),
            Devices::Cuda(device_indices) => device_indices.get(n).map(|idx| Device::Cuda(*idx)),
            _ => None,
        }
    }
}

fn get_all_device_strings() -> Vec<String> {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    if has_mps() {
        strings.push("mps".to_owned());
    }
    let cuda = get_cuda_devices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.push(format!("cuda:{}", cuda.into_iter().join(",")));
    }
    strings
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => {
                let available_cuda_devices = get_cuda_devices();
                if available_cuda_devices.is_empty() {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        "CUDA".to_owned(),
                        get_all_device_strings().join(", "),
                    ));
                }
                Ok(Devices::Cuda(available_cuda_devices))
            }
            "mps" => {
                if !has_mps() {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        "MPS".to_owned(),
                        get_all_device_strings().join(", "),
                    ));
                }
                Ok(Devices::Mps)
            }

            s if s.starts_with("cuda:") => {
                let devices_str = s
                    .strip_prefix("cuda:")
                    .expect("if it starts_with cuda:, strip_prefix can't fail");

                let available_cuda_devices = get_cuda_devices();
                if available_cuda_devices.is_empty() {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        "CUDA".to_owned(),
                        get_all_device_strings().join(", "),
                    ));
                }

                let device_ids = devices_str
                    .split(',')
                    .map(|id_str| {
                        let id = id_str.trim().parse::<usize>().map_err(|_| {
                            DevicesParseError::InvalidDeviceFormat(s.to_owned(), id_str.to_owned())
                        })?;
                        if !available_cuda_devices.contains(&id) {
                            return Err(DevicesParseError::DeviceNotAvailable(
                                format!("cuda:{id}"),
                                get_all_device_strings().join(", "),
                            ));
                        }
                        Ok(id)
                    })
                    .collect::<Result<Vec<usize>, _>>()?;

                if device_ids.is_empty() {
                    return Err(DevicesParseError::InvalidDevicesString(
                        s.to_string(),
                        get_all_device_strings().join(", "),
                    ));
                }

                Ok(Devices::Cuda(device_ids))
            }
            s => Err(DevicesParseError::InvalidDevicesString(
                s.to_string(),
                get_all_device_strings().join(", "),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert!("auto".parse::<Devices>().is_ok());
        assert!("".parse::<Devices>().is_err());
        assert!("banana".parse::<Devices>().is_err());
        assert_eq!("cpu".parse::<Devices>().unwrap(), Devices::Cpu);
        assert!("nvidia".parse::<Devices>().is_err());
        assert!("cuda:abc".parse::<Devices>().is_err());
        assert!("cuda:-1".parse::<Devices>().is_err());
    }

    #[test]
    fn cpu_only_serves_rank_zero() {
        assert_eq!(Devices::Cpu.device_for_rank(0), Some(Device::Cpu));
        assert_eq!(Devices::Cpu.device_for_rank(1), None);
    }

    #[test]
    fn cuda_rank_pinning() {
        let devices = Devices::Cuda(vec![0, 1]);
        assert_eq!(devices.device_for_rank(0), Some(Device::Cuda(0)));
        assert_eq!(devices.device_for_rank(1), Some(Device::Cuda(1)));
        assert_eq!(devices.device_for_rank(2), None);
    }
}
