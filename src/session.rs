//! Wires the media pipelines to presentation and rebuilds them on request.

use std::sync::Arc;

use ffmpeg_bus::{BusError, MediaBackend, MediaFrame, MediaKind, Pipeline, Sink};

use crate::control::Reconfigure;
use crate::present::Presenter;

pub struct Session<B: MediaBackend>
where
    B::Frame: MediaFrame,
{
    audio: Pipeline<B>,
    video: Pipeline<B>,
    presenter: Arc<Presenter<B::Frame>>,
    intake: Arc<dyn Sink<B::Frame>>,
}

impl<B> Session<B>
where
    B: MediaBackend + Clone,
    B::Frame: MediaFrame,
{
    pub fn new(backend: B, presenter: Arc<Presenter<B::Frame>>) -> Self {
        let intake: Arc<dyn Sink<B::Frame>> = presenter.clone();
        Self {
            audio: Pipeline::new("audio", MediaKind::Audio, backend.clone()),
            video: Pipeline::new("video", MediaKind::Video, backend),
            presenter,
            intake,
        }
    }
}

impl<B> Session<B>
where
    B: MediaBackend,
    B::Frame: MediaFrame,
{
    pub fn pipeline(&self, kind: MediaKind) -> &Pipeline<B> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn presenter(&self) -> &Arc<Presenter<B::Frame>> {
        &self.presenter
    }

    /// Stops input capture, then both pipelines, then presentation.
    pub fn shutdown(&self) {
        log::info!("Session: shutting down");
        self.presenter.stop_input();
        self.audio.stop();
        self.video.stop();
        self.presenter.stop_video();
        self.presenter.stop_audio();
    }
}

impl<B> Reconfigure for Session<B>
where
    B: MediaBackend,
    B::Frame: MediaFrame,
{
    fn reconfigure(&self, kind: MediaKind, descriptor: &str) -> Result<(), BusError> {
        let pipeline = self.pipeline(kind);

        pipeline.stop();
        self.presenter.pause(kind);

        if let Err(e) = pipeline.init(descriptor) {
            log::error!("Session: {} init from {} failed: {}", kind, descriptor, e);
            return Err(e);
        }
        if let Err(e) = self.presenter.prepare(kind) {
            log::warn!("Session: {} presentation not prepared: {}", kind, e);
        }
        pipeline.frames().attach(self.intake.clone());

        if let Err(e) = pipeline.start() {
            log::error!("Session: {} start failed: {}", kind, e);
            return Err(e);
        }
        if let Err(e) = self.presenter.resume(kind) {
            log::warn!("Session: {} presentation not resumed: {}", kind, e);
        }
        log::info!("Session: {} running from {}", kind, descriptor);
        Ok(())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
