use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;

/// A named OS thread paired with the token that asks it to stop.
///
/// Every run gets a fresh token; `stop` always joins.
pub struct Worker {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(token))?;
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signals the thread without waiting. Parked threads are woken.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.handle.thread().unpark();
    }

    pub fn stop(self) {
        self.cancel();
        if self.handle.join().is_err() {
            log::error!("{}: thread panicked", self.name);
        }
    }
}
