use candle_core::Device;
use clap::ValueEnum;
use log::{info, warn};

/// Compute device selection
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    /// Create a candle `Device` from this enum.
    pub fn to_device(&self, device_no: usize) -> candle_core::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(device_no)?,
            ComputeDevice::Cuda => Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }

    /// Like `to_device`, but an unavailable accelerator downgrades to
    /// the CPU with a warning instead of failing.
    pub fn to_device_or_cpu(&self, device_no: usize) -> Device {
        match self.to_device(device_no) {
            Ok(dev) => {
                info!("Using device: {:?}", dev);
                dev
            }
            Err(e) => {
                warn!("{:?} #{} not available ({}); using CPU", self, device_no, e);
                Device::Cpu
            }
        }
    }
}

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_available() {
        assert!(ComputeDevice::Cpu.to_device_or_cpu(0).is_cpu());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn missing_cuda_falls_back_to_cpu() {
        assert!(ComputeDevice::Cuda.to_device(0).is_err());
        assert!(ComputeDevice::Cuda.to_device_or_cpu(0).is_cpu());
    }
}
