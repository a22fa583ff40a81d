//! ONNX Runtime session construction shared by all models.

use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use std::path::Path;

const SESSION_INTRA_THREADS: usize = 2;

/// Execution device selected by the insightface-style context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    /// CUDA device ordinal. Falls back to CPU when the provider is unavailable.
    Cuda(i32),
}

impl ExecutionDevice {
    /// Negative context ids select the CPU, anything else a CUDA device.
    pub fn from_ctx_id(ctx_id: i32) -> Self {
        if ctx_id < 0 {
            Self::Cpu
        } else {
            Self::Cuda(ctx_id)
        }
    }
}

/// Build an inference session for `model_path` on `device`.
pub(crate) fn build_session(model_path: &Path, device: ExecutionDevice) -> Result<Session, ort::Error> {
    let builder = Session::builder()?.with_intra_threads(SESSION_INTRA_THREADS)?;

    let builder = match device {
        ExecutionDevice::Cpu => builder,
        ExecutionDevice::Cuda(device_id) => {
            let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
            builder.with_execution_providers([cuda.build()])?
        }
    };

    let session = builder.commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        ?device,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}
