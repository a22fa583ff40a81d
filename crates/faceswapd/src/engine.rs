use faceswap_core::{FaceAnalyzer, FaceSwapExecutor, IdentitySwapper, SwapError, SwapperModelArtifact};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Swap {
        target: PathBuf,
        source: PathBuf,
        reply: oneshot::Sender<Result<SwapperModelArtifact, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request a swap of the first face in `source` onto every face in `target`.
    pub async fn swap(&self, target: PathBuf, source: PathBuf) -> Result<SwapperModelArtifact, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Swap {
                target,
                source,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The executor arrives with its models already loaded; requests are served
/// one at a time in arrival order. The thread exits once every handle is dropped.
pub fn spawn_engine<A, S>(mut executor: FaceSwapExecutor<A, S>) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + Send + 'static,
    S: IdentitySwapper + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceswap-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Swap { target, source, reply } => {
                        let result = executor.swap_files(&target, &source);
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, target = %target.display(), "swap failed");
                        }
                        deliver(reply, result.map_err(EngineError::from));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Hand a result back to the waiting handler.
///
/// If the handler is gone (client disconnected), nobody will ever read the
/// result image, so it is removed here.
fn deliver(
    reply: oneshot::Sender<Result<SwapperModelArtifact, EngineError>>,
    result: Result<SwapperModelArtifact, EngineError>,
) {
    if let Err(Ok(artifact)) = reply.send(result) {
        let path = &artifact.result_image_path;
        tracing::warn!(path = %path.display(), "requester went away, removing orphaned result");
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove orphaned result");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fake_engine;
    use super::*;
    use faceswap_core::Config;
    use image::{Rgb, RgbImage};

    #[tokio::test]
    async fn test_engine_swaps_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("multi.png");
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])).save(&target).unwrap();

        let config = Config { output_dir: dir.path().join("Artifacts"), ..Config::default() };
        let engine = fake_engine(config, None);

        let artifact = engine.swap(target.clone(), target).await.unwrap();
        assert!(artifact.result_image_path.exists());
    }

    #[tokio::test]
    async fn test_engine_reports_domain_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { output_dir: dir.path().to_path_buf(), ..Config::default() };
        let engine = fake_engine(config, Some(PathBuf::from("weights/inswapper_128.onnx")));

        let err = engine
            .swap(PathBuf::from("/nonexistent/a.jpg"), PathBuf::from("/nonexistent/b.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Swap(SwapError::ModelNotFound(_))));
    }

    #[test]
    fn test_deliver_removes_result_when_requester_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swapped_face_20240101_000000.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let (tx, rx) = oneshot::channel();
        drop(rx);
        deliver(tx, Ok(SwapperModelArtifact { result_image_path: path.clone() }));
        assert!(!path.exists());
    }

    #[test]
    fn test_deliver_keeps_result_for_live_requester() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swapped_face_20240101_000000.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let (tx, mut rx) = oneshot::channel();
        deliver(tx, Ok(SwapperModelArtifact { result_image_path: path.clone() }));
        assert!(path.exists());
        assert!(rx.try_recv().unwrap().is_ok());
    }
}
