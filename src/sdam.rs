pub(crate) mod description;
mod monitor;
mod server;
mod topology;

use std::time::Duration;

pub(crate) use self::{
    description::{
        server::ServerDescription,
        topology::{TopologyDescription, TopologyType},
    },
    monitor::Monitor,
    server::Server,
    topology::{Topology, TopologyState, TopologyUpdater, TopologyWatcher},
};
pub use description::server::ServerType;

use crate::options::ServerAddress;

/// The default interval between server heartbeats.
pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The minimum amount of time a monitor waits between checks of the same
/// server, even when an immediate check has been requested.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// A description of the most up-to-date information known about a server, as
/// exposed to server-selection predicates.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    /// The address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// The type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// The average round trip time of the server's heartbeats, if it has been
    /// probed successfully.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }
}

impl std::fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("address", self.address())
            .field("server_type", &self.server_type())
            .finish()
    }
}
