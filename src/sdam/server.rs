use tokio::sync::watch;

use crate::{conn::ConnectionPool, options::ServerAddress};

/// The driver-side state for one known server: its address, its connection
/// pool, and the channel used to ask its monitor for an immediate check.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The pool of data-path connections to this server.
    pub(crate) pool: ConnectionPool,

    check_request_sender: watch::Sender<()>,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, pool: ConnectionPool) -> Self {
        let (check_request_sender, _) = watch::channel(());
        Self {
            address,
            pool,
            check_request_sender,
        }
    }

    /// Asks this server's monitor to check the server as soon as the minimum
    /// heartbeat interval allows, short-circuiting the regular wait.
    pub(crate) fn request_check(&self) {
        let _ = self.check_request_sender.send(());
    }

    /// The receiver half handed to this server's monitor.
    pub(crate) fn subscribe_check_requests(&self) -> watch::Receiver<()> {
        self.check_request_sender.subscribe()
    }
}
