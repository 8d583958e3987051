pub use embedding;
pub use sink_cache;
pub use sink_cache::{
    AttentionInputs, BoundedKeyValueCache, CacheError, CacheState, CacheWarning, EvictionLog,
    LayoutDescriptor, ModelFamily, PositionRemapper, RopeAdapter, StreamingConfig,
    StreamingSession,
};

use anyhow::Result;
use candle_core::Device;

/// Environment variable forcing the CPU backend.
pub const ENV_FORCE_CPU: &str = "CANDLE_FORCE_CPU";

pub fn setup_device() -> Result<Device> {
    log::debug!("starting device detection");

    if std::env::var(ENV_FORCE_CPU).is_ok() {
        log::info!("{ENV_FORCE_CPU} set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            if cache_preflight(&device).is_ok() {
                log::info!("CUDA device selected: {:?}", device);
                Ok(device)
            } else {
                log::warn!("CUDA device detected but preflight failed, falling back to CPU");
                Ok(Device::Cpu)
            }
        }
        Ok(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
        Err(err) => {
            log::warn!("CUDA probe failed ({err}), using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Run the tensor ops the cache relies on (narrow, cat, index_select) once on `device`.
fn cache_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor};

    let kv = Tensor::randn(0.0f32, 1.0f32, (1, 2, 8, 4), device)?;
    let kept = Tensor::cat(&[kv.narrow(2, 0, 2)?, kv.narrow(2, 5, 3)?], 2)?;
    let _ = kept.contiguous()?;

    let host = (0..8u32).collect::<Vec<_>>();
    let indices = Tensor::from_vec(host, (8,), &Device::Cpu)?.to_device(device)?;
    let table = Tensor::zeros((8, 2), DType::F32, device)?;
    let _ = table.index_select(&indices, 0)?;

    Ok(())
}
