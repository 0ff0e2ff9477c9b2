//! Session controller.
//!
//! [`Encoder`] owns the frame queue and spawns one encode worker per session.
//! Callers feed frames from any thread with [`Encoder::add_frame`] and end the
//! session with [`Encoder::finish`] (encode the backlog) or
//! [`Encoder::stop`] (abandon it). The outcome is delivered once through the
//! [`Completion`] returned by [`Encoder::start`] and to the optional finish
//! listener.
//!
//! # Example
//!
//! ```ignore
//! use bitmp4::{Encoder, EncodingOptions, Frame};
//!
//! let mut encoder = Encoder::new(EncodingOptions::new("export.mp4").output_size(320, 240));
//! let completion = encoder.start()?;
//! for _ in 0..30 {
//!     encoder.add_frame(Frame::solid(320, 240, 0xFF336699));
//! }
//! encoder.finish();
//! let outcome = completion.wait().await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use bitmp4_codec::Frame;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::backend::{MediaBackend, SoftwareBackend};
use crate::options::{CompressionLevel, EncodingOptions};
use crate::queue::{FrameQueue, SessionState};
use crate::worker::{EncodeOutcome, EncodeWorker, SessionParts};

/// Callback invoked once per session, after teardown, with the outcome.
pub type FinishListener = Arc<dyn Fn(&EncodeOutcome) + Send + Sync>;

/// Resolves when the session's worker has finished tearing down.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<EncodeOutcome>,
}

impl Completion {
    /// Wait for the outcome.
    pub async fn wait(self) -> Result<EncodeOutcome> {
        self.rx
            .await
            .context("encode worker exited without reporting an outcome")
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_wait(self) -> Result<EncodeOutcome> {
        self.rx
            .blocking_recv()
            .context("encode worker exited without reporting an outcome")
    }

    /// Return the outcome if the session has already ended.
    pub fn try_outcome(&mut self) -> Option<EncodeOutcome> {
        self.rx.try_recv().ok()
    }
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Records frames into a fragmented MP4 file on a background thread.
pub struct Encoder {
    options: EncodingOptions,
    backend: Arc<dyn MediaBackend>,
    queue: Arc<FrameQueue>,
    listener: Option<FinishListener>,
    session: Option<Session>,
}

impl Encoder {
    /// Create an encoder using the software codecs and MP4 writer.
    pub fn new(options: EncodingOptions) -> Self {
        Self::with_backend(options, Arc::new(SoftwareBackend::new()))
    }

    /// Create an encoder with custom codecs and container.
    pub fn with_backend(options: EncodingOptions, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            options,
            backend,
            queue: Arc::new(FrameQueue::new()),
            listener: None,
            session: None,
        }
    }

    pub fn options(&self) -> &EncodingOptions {
        &self.options
    }

    /// Replace the options. Takes effect at the next [`start`](Self::start).
    pub fn set_options(&mut self, options: EncodingOptions) {
        self.options = options;
    }

    pub fn set_output_path(&mut self, path: impl AsRef<Path>) {
        self.options.output_path = path.as_ref().to_path_buf();
    }

    pub fn set_output_size(&mut self, width: u32, height: u32) {
        self.options.width = width;
        self.options.height = height;
    }

    pub fn set_frame_delay(&mut self, delay: Duration) {
        self.options.frame_delay = delay;
    }

    pub fn set_compression(&mut self, level: CompressionLevel) {
        self.options.compression = level;
    }

    /// Register a callback for session outcomes, replacing any previous one.
    pub fn set_finish_listener<F>(&mut self, listener: F)
    where
        F: Fn(&EncodeOutcome) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
    }

    /// Start a new session.
    ///
    /// Fails if a previous session's worker is still running, if the options
    /// are invalid, or if the backend cannot create the codecs or container.
    /// On failure the encoder stays idle.
    pub fn start(&mut self) -> Result<Completion> {
        if self.is_running() {
            anyhow::bail!("an encoding session is already running");
        }
        if let Some(previous) = self.session.take() {
            if previous.handle.join().is_err() {
                tracing::error!("Previous encode worker panicked");
            }
        }

        let options = self.options.clone();
        options.validate()?;

        self.queue.begin_session();
        let parts = match self.create_parts(&options) {
            Ok(parts) => parts,
            Err(e) => {
                self.queue.end_session();
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let worker = EncodeWorker::new(
            self.queue.clone(),
            cancel.clone(),
            parts,
            options.output_path.clone(),
        );
        let listener = self.listener.clone();
        let (tx, rx) = oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name("encode-worker".to_string())
            .spawn(move || {
                let outcome = worker.run();
                if let Some(listener) = listener {
                    listener(&outcome);
                }
                // The caller may have dropped the completion
                let _ = tx.send(outcome);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.end_session();
                return Err(e).context("failed to spawn encode worker");
            }
        };

        tracing::info!(
            "Encoding session started: {} ({}x{}, compression {})",
            options.output_path.display(),
            options.width,
            options.height,
            options.compression
        );
        self.session = Some(Session { cancel, handle });
        Ok(Completion { rx })
    }

    fn create_parts(&self, options: &EncodingOptions) -> Result<SessionParts> {
        let video = self
            .backend
            .create_video_codec(&options.video_config())
            .context("failed to create video codec")?;
        let audio = self
            .backend
            .create_audio_codec(&options.audio_config())
            .context("failed to create audio codec")?;
        let container = self
            .backend
            .create_container(&options.output_path)
            .with_context(|| {
                format!(
                    "failed to create container at {}",
                    options.output_path.display()
                )
            })?;
        Ok(SessionParts {
            video,
            audio,
            container,
        })
    }

    /// Queue a frame for encoding.
    ///
    /// Returns `false` when no session is recording; the frame is dropped.
    pub fn add_frame(&self, frame: Frame) -> bool {
        self.queue.enqueue(frame)
    }

    /// End the session now, abandoning frames that have not been encoded.
    ///
    /// Frames already handed to the codecs are drained once and the container
    /// is finalized. Does nothing when idle.
    pub fn stop(&self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
        let abandoned = self.queue.request_stop();
        if abandoned > 0 {
            tracing::info!("Stopped with {} queued frames abandoned", abandoned);
        }
    }

    /// Stop accepting frames and finish once the backlog is encoded.
    ///
    /// Returns `false` if no session was recording.
    pub fn finish(&self) -> bool {
        self.queue.request_finish()
    }

    pub fn state(&self) -> SessionState {
        self.queue.state()
    }

    /// Whether a worker thread is still alive.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Number of frames waiting to be encoded.
    pub fn pending_frames(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::debug!("Encoder dropped while running, stopping session");
            self.stop();
        }
    }
}
