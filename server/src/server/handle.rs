use tokio::sync::mpsc::UnboundedSender;

use super::Command;

/// cheap clonable handle for stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) tx: UnboundedSender<Command>,
}

impl ServerHandle {
    /// stop the server. with `graceful` accept loops stop first and in
    /// flight connections get the configured drain window.
    pub fn stop(&self, graceful: bool) {
        let cmd = if graceful {
            Command::GracefulStop
        } else {
            Command::ForceStop
        };

        let _ = self.tx.send(cmd);
    }
}
