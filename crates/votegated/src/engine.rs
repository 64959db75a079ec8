use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use votegate_core::{
    decode_frame, EmbeddingExtractor, Embedding, ExtractError, Frame, Gate, GallerySnapshot,
    VerifyOutcome,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from D-Bus handlers to the engine thread.
///
/// Images travel as encoded bytes; decoding happens on the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
    Verify {
        image: Vec<u8>,
        gallery: GallerySnapshot,
        reply: oneshot::Sender<Result<Option<String>, ExtractError>>,
    },
    VerifyIdentity {
        image: Vec<u8>,
        gallery: GallerySnapshot,
        claimed: String,
        reply: oneshot::Sender<Result<VerifyOutcome, ExtractError>>,
    },
    IsDuplicate {
        image: Vec<u8>,
        gallery: GallerySnapshot,
        reply: oneshot::Sender<Result<Option<String>, ExtractError>>,
    },
    Eyes {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<bool, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    model_id: String,
    threshold: f32,
    timeout: Duration,
}

impl EngineHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Embedding of the face in `image`, for enrollment.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        self.request(|reply| EngineRequest::Extract { image, reply }).await
    }

    /// Identity in `gallery` matching the face in `image`.
    pub async fn verify(
        &self,
        image: Vec<u8>,
        gallery: GallerySnapshot,
    ) -> Result<Option<String>, EngineError> {
        self.request(|reply| EngineRequest::Verify {
            image,
            gallery,
            reply,
        })
        .await
    }

    /// Check the face in `image` against the identity the caller claims.
    pub async fn verify_identity(
        &self,
        image: Vec<u8>,
        gallery: GallerySnapshot,
        claimed: String,
    ) -> Result<VerifyOutcome, EngineError> {
        self.request(|reply| EngineRequest::VerifyIdentity {
            image,
            gallery,
            claimed,
            reply,
        })
        .await
    }

    /// Identity already enrolled with the face in `image`.
    pub async fn is_duplicate(
        &self,
        image: Vec<u8>,
        gallery: GallerySnapshot,
    ) -> Result<Option<String>, EngineError> {
        self.request(|reply| EngineRequest::IsDuplicate {
            image,
            gallery,
            reply,
        })
        .await
    }

    /// Whether any face in `image` shows an open eye.
    pub async fn eyes(&self, image: Vec<u8>) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Eyes { image, reply }).await
    }

    /// Send one request and wait for its reply, bounded by the engine timeout.
    ///
    /// On timeout the reply receiver is dropped; the engine finishes the
    /// work and discards the result.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ExtractError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = self.exchange(build(reply_tx), reply_rx);
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "engine request timed out");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }

    async fn exchange<T>(
        &self,
        req: EngineRequest,
        reply_rx: oneshot::Receiver<Result<T, ExtractError>>,
    ) -> Result<T, EngineError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(result?)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `gate` owns the models; `check_eyes` answers liveness eye checks with the
/// same extractor so detection sessions are not loaded twice.
pub fn spawn_engine<E, P>(
    gate: Gate<E>,
    mut check_eyes: P,
    timeout: Duration,
) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
    P: FnMut(&mut E, &Frame) -> Result<bool, ExtractError> + Send + 'static,
{
    let model_id = gate.model_id().to_string();
    let threshold = gate.threshold();
    let mut gate = gate;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("votegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = decode(&image).and_then(|frame| gate.register_face(&frame));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify {
                        image,
                        gallery,
                        reply,
                    } => {
                        let result =
                            decode(&image).and_then(|frame| gate.verify_face(&frame, &gallery));
                        let _ = reply.send(result);
                    }
                    EngineRequest::VerifyIdentity {
                        image,
                        gallery,
                        claimed,
                        reply,
                    } => {
                        let result = decode(&image)
                            .and_then(|frame| gate.verify_identity(&frame, &gallery, &claimed));
                        let _ = reply.send(result);
                    }
                    EngineRequest::IsDuplicate {
                        image,
                        gallery,
                        reply,
                    } => {
                        let result =
                            decode(&image).and_then(|frame| gate.is_duplicate(&frame, &gallery));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Eyes { image, reply } => {
                        let result = decode(&image)
                            .and_then(|frame| check_eyes(gate.extractor_mut(), &frame));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle {
        tx,
        model_id,
        threshold,
        timeout,
    })
}

fn decode(image: &[u8]) -> Result<Frame, ExtractError> {
    let frame = decode_frame(image)?;
    tracing::debug!(width = frame.width(), height = frame.height(), "frame decoded");
    Ok(frame)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use votegate_core::GalleryEntry;

    /// Mean-color embedding; bright frames count as "eyes open".
    pub(crate) struct ColorExtractor {
        pub delay: Duration,
    }

    impl EmbeddingExtractor for ColorExtractor {
        fn model_id(&self) -> &str {
            "color"
        }

        fn default_threshold(&self) -> f32 {
            0.40
        }

        fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
            std::thread::sleep(self.delay);
            if frame.is_dark() {
                return Err(ExtractError::NoFaceDetected);
            }
            let n = (frame.width() * frame.height()) as f32;
            let mut sums = [0.0f32; 3];
            for p in frame.rgb.pixels() {
                for (sum, v) in sums.iter_mut().zip(p.0) {
                    *sum += v as f32;
                }
            }
            Ok(Embedding::new(sums.iter().map(|s| s / n).collect(), "color"))
        }
    }

    pub(crate) fn png(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub(crate) fn spawn_color_engine(delay: Duration, timeout: Duration) -> EngineHandle {
        spawn_engine(
            Gate::new(ColorExtractor { delay }),
            |_: &mut ColorExtractor, frame: &Frame| Ok(frame.avg_brightness() > 128.0),
            timeout,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_extract_and_verify_roundtrip() {
        let engine = spawn_color_engine(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(engine.model_id(), "color");

        let embedding = engine.extract(png([200, 40, 40])).await.unwrap();
        let gallery = GallerySnapshot::from_entries(vec![GalleryEntry {
            identity: "alice".into(),
            embedding,
        }]);

        let found = engine.verify(png([180, 36, 36]), gallery.clone()).await.unwrap();
        assert_eq!(found.as_deref(), Some("alice"));

        let outcome = engine
            .verify_identity(png([200, 40, 40]), gallery.clone(), "bob".into())
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);

        let dup = engine.is_duplicate(png([40, 40, 200]), gallery).await.unwrap();
        assert_eq!(dup, None);
    }

    #[tokio::test]
    async fn test_no_face_and_corrupt_image_are_distinct() {
        let engine = spawn_color_engine(Duration::ZERO, Duration::from_secs(5));

        let dark = engine.extract(png([0, 0, 0])).await;
        assert!(matches!(dark, Err(EngineError::Extract(ExtractError::NoFaceDetected))));

        let garbage = engine.extract(b"not an image".to_vec()).await;
        assert!(matches!(garbage, Err(EngineError::Extract(ExtractError::Extraction(_)))));
    }

    #[tokio::test]
    async fn test_eyes_check() {
        let engine = spawn_color_engine(Duration::ZERO, Duration::from_secs(5));
        assert!(engine.eyes(png([220, 220, 220])).await.unwrap());
        assert!(!engine.eyes(png([60, 60, 60])).await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_extraction_times_out() {
        let engine = spawn_color_engine(Duration::from_millis(300), Duration::from_millis(20));
        let result = engine.extract(png([200, 40, 40])).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }
}
