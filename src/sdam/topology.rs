use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    description::server::ServerDescription,
    Monitor,
    Server,
    TopologyDescription,
};
use crate::{
    client::session::ClusterTime,
    conn::{pool::ConnectionPoolOptions, ConnectionPool, Handshaker},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    selection_criteria::SelectionCriteria,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// An atomic snapshot of the driver's model of the deployment: the
/// description plus the live per-server state (pools and check channels).
/// Selectors observe whole snapshots; a monitor update is never seen torn.
#[derive(Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The driver's live model of the deployment. Monitors publish
/// `ServerDescription` updates through the `TopologyUpdater` sink; the
/// `TopologyWatcher` side hands out snapshots and wakes waiting selectors on
/// every change.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let initial_state = Arc::new(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });
        let (sender, receiver) = watch::channel(initial_state);

        let updater = TopologyUpdater {
            inner: Arc::new(UpdaterInner {
                state: Mutex::new(TopologyState {
                    description,
                    servers: HashMap::new(),
                }),
                sender,
                handshaker: Handshaker::new(&options),
                options,
            }),
        };
        let watcher = TopologyWatcher { receiver };

        // Start a monitor for every seed.
        {
            let mut state = updater.inner.state.lock().unwrap();
            let addresses: Vec<ServerAddress> =
                state.description.server_addresses().cloned().collect();
            for address in addresses {
                updater.add_server(&mut state, address, &watcher);
            }
            updater.publish(&state);
        }

        Ok(Self { updater, watcher })
    }

    pub(crate) fn watcher(&self) -> &TopologyWatcher {
        &self.watcher
    }

    pub(crate) fn updater(&self) -> &TopologyUpdater {
        &self.updater
    }

    /// Selects a server matching the given criteria, waiting for the topology
    /// to settle (re-checking on every monitor update) up to the server
    /// selection timeout.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<(Arc<Server>, ServerDescription)> {
        let timeout = self
            .updater
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let mut watcher = self.watcher.clone();

        loop {
            // Mark the current snapshot seen before inspecting it so that an
            // update arriving between the check and the wait wakes us.
            let state = watcher.latest_and_mark_seen();

            match state.description.select_server(criteria)? {
                Some(description) => {
                    if let Some(server) = state.servers.get(&description.address) {
                        return Ok((server.clone(), description.clone()));
                    }
                }
                None => {}
            }

            // Ask every monitor to re-check now rather than waiting out its
            // heartbeat interval.
            for server in state.servers.values() {
                server.request_check();
            }

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                    }
                    .into())
                }
            };

            if !watcher.wait_for_update(remaining).await {
                let state = watcher.latest_and_mark_seen();
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    /// The highest `$clusterTime` observed from any server or reply.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher.latest().description.cluster_time().cloned()
    }

    pub(crate) fn advance_cluster_time(&self, cluster_time: &ClusterTime) {
        self.updater.advance_cluster_time(cluster_time);
    }

    /// The deployment's logical session timeout, if sessions are supported.
    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.latest().description.logical_session_timeout
    }

    #[cfg(test)]
    pub(crate) fn topology_type(&self) -> super::TopologyType {
        self.watcher.latest().description.topology_type
    }

    /// Reacts to an error that occurred on the data path: network errors and
    /// state-change server errors mark the server Unknown, discard its pool,
    /// and request an immediate re-check.
    pub(crate) fn handle_application_error(&self, address: &ServerAddress, error: &Error) {
        if error.requires_server_reset() {
            self.updater.mark_server_unknown(address, error.clone());
        }
    }
}

#[derive(Debug)]
struct UpdaterInner {
    state: Mutex<TopologyState>,
    sender: watch::Sender<Arc<TopologyState>>,
    handshaker: Handshaker,
    options: ClientOptions,
}

/// The single sink through which monitors publish into the shared topology.
/// Updates are serialized by the state lock and published as whole snapshots.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    inner: Arc<UpdaterInner>,
}

/// The weak handle handed to monitors. Monitors must not keep the topology
/// alive: when the last client handle drops, upgrades start failing and every
/// monitor winds down.
#[derive(Clone, Debug)]
pub(crate) struct WeakTopologyUpdater {
    inner: std::sync::Weak<UpdaterInner>,
}

impl WeakTopologyUpdater {
    pub(crate) fn upgrade(&self) -> Option<TopologyUpdater> {
        self.inner.upgrade().map(|inner| TopologyUpdater { inner })
    }
}

impl TopologyUpdater {
    pub(crate) fn downgrade(&self) -> WeakTopologyUpdater {
        WeakTopologyUpdater {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Applies a new server description to the topology, spawning or retiring
    /// monitors implied by the updated host list.
    pub(crate) fn update(&self, description: ServerDescription) -> bool {
        let watcher = TopologyWatcher {
            receiver: self.inner.sender.subscribe(),
        };
        let mut state = self.inner.state.lock().unwrap();

        if let Err(error) = state.description.update(description) {
            warn!(%error, "ignoring invalid topology update");
            return false;
        }

        self.sync_servers(&mut state, &watcher);
        self.publish(&state);
        true
    }

    /// Records a failed heartbeat: the server becomes Unknown (carrying the
    /// error) and its pool is cleared.
    pub(crate) fn handle_monitor_error(&self, address: &ServerAddress, error: Error) {
        debug!(address = %address, %error, "heartbeat failed");
        self.mark_server_unknown(address, error);
    }

    pub(crate) fn mark_server_unknown(&self, address: &ServerAddress, error: Error) {
        let watcher = TopologyWatcher {
            receiver: self.inner.sender.subscribe(),
        };
        let mut state = self.inner.state.lock().unwrap();

        if let Some(server) = state.servers.get(address) {
            server.pool.clear();
            server.request_check();
        }

        let description = ServerDescription::new_from_error(address, error);
        if let Err(error) = state.description.update(description) {
            warn!(%error, "ignoring invalid topology update");
            return;
        }

        self.sync_servers(&mut state, &watcher);
        self.publish(&state);
    }

    pub(crate) fn advance_cluster_time(&self, cluster_time: &ClusterTime) {
        let mut state = self.inner.state.lock().unwrap();
        state.description.advance_cluster_time(cluster_time);
        self.publish(&state);
    }

    /// Aligns the live server map with the description's address set: new
    /// addresses get a pool and a monitor, removed addresses are dropped (their
    /// monitors observe the removal and stop).
    fn sync_servers(&self, state: &mut TopologyState, watcher: &TopologyWatcher) {
        let addresses: Vec<ServerAddress> =
            state.description.server_addresses().cloned().collect();

        for address in &addresses {
            if !state.servers.contains_key(address) {
                self.add_server(state, address.clone(), watcher);
            }
        }

        state
            .servers
            .retain(|address, _| addresses.contains(address));
    }

    fn add_server(
        &self,
        state: &mut TopologyState,
        address: ServerAddress,
        watcher: &TopologyWatcher,
    ) {
        let pool = ConnectionPool::new(
            address.clone(),
            self.inner.handshaker.clone(),
            ConnectionPoolOptions::from_client_options(&self.inner.options),
        );
        let server = Arc::new(Server::new(address.clone(), pool));

        debug!(address = %address, "adding server to topology");

        Monitor::start(
            address.clone(),
            self.downgrade(),
            watcher.clone(),
            server.subscribe_check_requests(),
            self.inner.options.clone(),
        );

        state.servers.insert(address, server);
    }

    /// Swaps in a fresh snapshot for watchers. Selectors either see the state
    /// before an update or after it, never a torn intermediate.
    fn publish(&self, state: &TopologyState) {
        let snapshot = Arc::new(TopologyState {
            description: state.description.clone(),
            servers: state.servers.clone(),
        });
        let _ = self.inner.sender.send(snapshot);
    }
}

/// A read handle on the topology: cheap snapshots plus change notification.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<Arc<TopologyState>>,
}

impl TopologyWatcher {
    /// The most recently published snapshot.
    pub(crate) fn latest(&self) -> Arc<TopologyState> {
        self.receiver.borrow().clone()
    }

    /// The most recent snapshot, marking it seen so `wait_for_update` only
    /// wakes for changes published after this call.
    pub(crate) fn latest_and_mark_seen(&mut self) -> Arc<TopologyState> {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits for a newer snapshot, returning false if the timeout elapsed
    /// first.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Whether the owning topology still exists.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn monitors_address(&self, address: &ServerAddress) -> bool {
        self.receiver
            .borrow()
            .description
            .servers
            .contains_key(address)
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        hello::{HelloCommandResponse, HelloReply},
        selection_criteria::ReadPreference,
    };

    fn standalone_reply(address: &ServerAddress) -> ServerDescription {
        ServerDescription::new_from_hello_reply(
            address,
            HelloReply {
                server_address: address.clone(),
                command_response: HelloCommandResponse {
                    min_wire_version: Some(6),
                    max_wire_version: Some(17),
                    logical_session_timeout_minutes: Some(30),
                    ..Default::default()
                },
                cluster_time: None,
            },
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn selection_times_out_with_no_servers() {
        // TEST-NET address: never routable, so the monitor stays silent.
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("198.51.100.1:27017").unwrap()])
            .server_selection_timeout(Duration::from_millis(50))
            .build();
        let topology = Topology::new(options).unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology.select_server(&criteria).await.unwrap_err();
        assert!(err.is_server_selection_error());
    }

    #[tokio::test]
    async fn selection_sees_monitor_updates() {
        let address = ServerAddress::parse("198.51.100.1:27017").unwrap();
        let options = ClientOptions::builder()
            .hosts(vec![address.clone()])
            .server_selection_timeout(Duration::from_secs(5))
            .build();
        let topology = Topology::new(options).unwrap();

        let updater = topology.updater().clone();
        let update_address = address.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            updater.update(standalone_reply(&update_address));
        });

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let (server, description) = topology.select_server(&criteria).await.unwrap();
        assert_eq!(server.address, address);
        assert_eq!(description.server_type, crate::sdam::ServerType::Standalone);
        assert_eq!(topology.topology_type(), crate::sdam::TopologyType::Single);
    }

    #[tokio::test]
    async fn marking_unknown_clears_state_and_selection_fails_fast() {
        let address = ServerAddress::parse("198.51.100.1:27017").unwrap();
        let options = ClientOptions::builder()
            .hosts(vec![address.clone()])
            .server_selection_timeout(Duration::from_millis(100))
            .build();
        let topology = Topology::new(options).unwrap();
        topology.updater().update(standalone_reply(&address));

        topology
            .updater()
            .mark_server_unknown(&address, crate::error::Error::network_timeout());

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology.select_server(&criteria).await.unwrap_err();
        assert!(err.is_server_selection_error());

        let description = topology
            .watcher()
            .server_description(&address)
            .unwrap();
        assert!(!description.is_available());
        assert!(description.error().is_some());
    }
}
