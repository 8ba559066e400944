use std::sync::Arc;

use ffmpeg_bus::{BusError, MediaKind};

use crate::config::HandoffPaths;
use crate::protocol::{ControlMessage, RECONFIGURE};

/// Payload kind: a session description to be written to a handoff file.
pub const PAYLOAD_SESSION_DESCRIPTION: i64 = 0;
/// Payload kind: a transport descriptor opened as is.
pub const PAYLOAD_TRANSPORT: i64 = 1;

/// Rebuilds the media path of one kind around a new source descriptor.
pub trait Reconfigure: Send + Sync {
    fn reconfigure(&self, kind: MediaKind, descriptor: &str) -> Result<(), BusError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Not a reconfiguration command.
    Ignored,
    /// A reconfiguration command that couldn't be acted upon.
    Rejected,
    Reconfigured(MediaKind),
    /// The handler was invoked and reported an error.
    Failed(MediaKind),
}

/// Routes inbound control messages to a [`Reconfigure`] handler.
pub struct Dispatcher {
    handler: Arc<dyn Reconfigure>,
    handoff: HandoffPaths,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn Reconfigure>, handoff: HandoffPaths) -> Self {
        Self { handler, handoff }
    }

    pub fn dispatch(&self, message: &ControlMessage) -> Dispatched {
        if message.tag != RECONFIGURE {
            log::trace!("Control: ignoring message of type {:?}", message.tag);
            return Dispatched::Ignored;
        }

        let Some(kind) = message.group.and_then(MediaKind::from_group) else {
            log::warn!("Control: unknown reconfiguration group {:?}", message.group);
            return Dispatched::Rejected;
        };
        let Some(value) = message.value.as_deref() else {
            log::warn!("Control: {} reconfiguration without a payload", kind);
            return Dispatched::Rejected;
        };

        let descriptor = match message.kind {
            Some(PAYLOAD_SESSION_DESCRIPTION) => {
                let path = self.handoff.path(kind);
                if let Err(e) = std::fs::write(path, format!("{}\n", value)) {
                    log::error!(
                        "Control: couldn't write {} session description to {}: {}",
                        kind,
                        path.display(),
                        e
                    );
                    return Dispatched::Rejected;
                }
                path.to_string_lossy().into_owned()
            }
            Some(PAYLOAD_TRANSPORT) => value.to_string(),
            other => {
                log::warn!("Control: unknown {} payload kind {:?}", kind, other);
                return Dispatched::Rejected;
            }
        };

        log::info!("Control: reconfiguring {} from {}", kind, descriptor);
        match self.handler.reconfigure(kind, &descriptor) {
            Ok(()) => Dispatched::Reconfigured(kind),
            Err(e) => {
                log::error!("Control: {} reconfiguration failed: {}", kind, e);
                Dispatched::Failed(kind)
            }
        }
    }
}
