use std::sync::Arc;

use clap::Parser;
use ffmpeg_bus::{FfmpegBackend, RawFrame, Sink};
use tokio_util::sync::CancellationToken;

mod config;
mod control;
mod present;
mod protocol;
mod session;
mod terminal;

use config::{Cli, ClientConfig};
use control::{ControlChannel, Dispatcher};
use present::Presenter;
use protocol::Outbound;
use session::Session;
use terminal::{CpalOutput, TerminalInput, TerminalScreen};

/// Logs go to stderr; redirect it while the terminal UI is up.
fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("ffmpeg_bus", log::LevelFilter::Info)
        .filter_module("remote_client", log::LevelFilter::Info)
        .init();
}

fn start(presenter: &Presenter<RawFrame>, control: &ControlChannel) -> anyhow::Result<()> {
    presenter.start_video()?;
    presenter.start_audio()?;
    control.start()?;
    control.send(&Outbound::rtp_request())?;
    presenter.start_input()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = ClientConfig::from(Cli::parse());
    ffmpeg_bus::init()?;
    ffmpeg_bus::quiet_ffmpeg_logging();

    let shutdown = CancellationToken::new();
    let speaker = CpalOutput::open()?;
    let picker = terminal::create_picker(config.graphics());
    let screen = TerminalScreen::open(picker)?;
    let input = TerminalInput::new(screen.reports_key_release(), shutdown.clone());
    let presenter = Arc::new(Presenter::new(
        Box::new(screen),
        Box::new(speaker),
        Box::new(input),
    ));

    let session = Arc::new(Session::new(FfmpegBackend, presenter.clone()));
    let control = Arc::new(ControlChannel::new(Dispatcher::new(
        session.clone(),
        config.handoff(),
    )));
    control.init(config.remote(), config.local_port())?;

    let commands: Arc<dyn Sink<String>> = control.clone();
    presenter.commands().attach(commands.clone());

    let started = start(&presenter, &control);
    match &started {
        Ok(()) => {
            log::info!("Client: connected to {}", config.remote());
            tokio::select! {
                _ = shutdown.cancelled() => {},
                _ = tokio::signal::ctrl_c() => {
                    shutdown.cancel();
                },
            }
        }
        Err(e) => log::error!("Client: startup failed: {}", e),
    }

    tokio::task::spawn_blocking(move || {
        control.stop();
        session.shutdown();
        let stats = presenter.stats();
        log::info!(
            "Client: video {} shown, {} dropped; audio {} played, {} dropped",
            stats.video.presented,
            stats.video.dropped,
            stats.audio.presented,
            stats.audio.dropped
        );
        presenter.commands().detach(&commands);
        // Last owner of the screen; dropping it restores the terminal.
        drop(commands);
        drop(control);
        drop(session);
        drop(presenter);
    })
    .await?;

    log::info!("Client: stopped");
    started
}
