//! Compute device selection

use crate::error::ModelError;
use candle_core::{DType, Device};

/// Device profile probed once at startup and passed explicitly to every
/// component that needs it.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub dtype: DType,
}

impl DeviceProfile {
    /// Probe the hardware once; CUDA wins when present, otherwise CPU.
    pub fn detect() -> Result<Self, ModelError> {
        let device = Device::cuda_if_available(0)?;
        let dtype = dtype_for(device.is_cuda());
        Ok(Self { device, dtype })
    }

    pub fn is_accelerated(&self) -> bool {
        self.device.is_cuda()
    }
}

/// Numeric precision as a pure function of the probe result.
pub fn dtype_for(cuda: bool) -> DType {
    if cuda { DType::BF16 } else { DType::F32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_is_a_pure_function_of_the_probe() {
        assert_eq!(dtype_for(true), DType::BF16);
        assert_eq!(dtype_for(false), DType::F32);
    }

    #[test]
    fn detect_always_yields_a_profile() {
        let profile = DeviceProfile::detect().unwrap();
        assert_eq!(profile.dtype, dtype_for(profile.is_accelerated()));
    }
}
