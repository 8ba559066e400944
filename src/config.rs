use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use ffmpeg_bus::MediaKind;

/// Receives a remote desktop stream and sends local input back.
#[derive(Parser, Debug)]
#[command(name = "remote-client", version)]
pub struct Cli {
    /// Address of the remote desktop server
    pub remote_ip: IpAddr,

    /// Control port on the server
    #[arg(default_value_t = 9999)]
    pub remote_port: u16,

    /// Local port the control sockets bind to
    #[arg(default_value_t = 9999)]
    pub local_port: u16,

    /// Directory for the session description handoff files
    #[arg(long, default_value = ".")]
    pub sdp_dir: PathBuf,

    /// Force a terminal graphics protocol (sixel, kitty, iterm2, halfblocks)
    #[arg(long)]
    pub graphics: Option<String>,
}

pub struct ClientConfig {
    remote: SocketAddr,
    local_port: u16,
    sdp_dir: PathBuf,
    graphics: Option<String>,
}

impl ClientConfig {
    pub fn new(remote: SocketAddr, local_port: u16, sdp_dir: &Path) -> Self {
        Self {
            remote,
            local_port,
            sdp_dir: sdp_dir.to_path_buf(),
            graphics: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn graphics(&self) -> Option<&str> {
        self.graphics.as_deref()
    }

    pub fn handoff(&self) -> HandoffPaths {
        HandoffPaths::in_dir(&self.sdp_dir)
    }
}

impl From<Cli> for ClientConfig {
    fn from(cli: Cli) -> Self {
        let mut config = ClientConfig::new(
            SocketAddr::new(cli.remote_ip, cli.remote_port),
            cli.local_port,
            &cli.sdp_dir,
        );
        config.graphics = cli.graphics;
        config
    }
}

/// Where session descriptions received over the control channel are written
/// before being opened as a pipeline source.
#[derive(Debug, Clone)]
pub struct HandoffPaths {
    audio: PathBuf,
    video: PathBuf,
}

impl HandoffPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            audio: dir.join("sdp_audio"),
            video: dir.join("sdp_video"),
        }
    }

    pub fn path(&self, kind: MediaKind) -> &Path {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}
