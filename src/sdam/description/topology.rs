pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;

use crate::{
    client::session::ClusterTime,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
};

pub(crate) use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the
    /// topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of
    /// the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with
    /// regards to the respective supported wire versions, if any.
    pub(crate) compatibility_error: Option<String>,

    /// The time that a session remains active after its most recent use,
    /// taken as the minimum over all data-bearing members.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest reported cluster time by any server in this topology.
    pub(crate) cluster_time: Option<ClusterTime>,

    /// The amount of latency beyond that of the suitable server with the
    /// minimum latency that is acceptable for a read operation.
    pub(crate) local_threshold: Option<Duration>,

    /// The interval between server checks.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            cluster_time: None,
            local_threshold: None,
            heartbeat_freq: None,
            servers: Default::default(),
        }
    }
}

impl TopologyDescription {
    /// Derives the initial topology from the client options: `replicaSet`
    /// forces a replica set topology, `loadBalanced` a load balanced one, and
    /// `directConnection` with a single seed a Single one.
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.servers.is_empty() && self.topology_type == TopologyType::Unknown,
            "new TopologyDescriptions should start empty"
        );

        self.topology_type = if let Some(true) = options.direct_connection {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.load_balanced.unwrap_or(false) {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        for address in options.hosts.iter() {
            let description = ServerDescription::new(address);
            self.servers.insert(description.address.clone(), description);
        }

        self.single_seed = self.servers.len() == 1;
        self.set_name.clone_from(&options.repl_set_name);
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;

        if self.topology_type == TopologyType::LoadBalanced {
            // A load balancer is never probed, so mark it available as-is.
            for server in self.servers.values_mut() {
                server.server_type = ServerType::LoadBalancer;
            }
        }
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Attaches `$readPreference` to an outgoing command where the receiving
    /// server needs it: mongos routers forward non-primary preferences, and
    /// direct connections to replica set members resolve to primaryPreferred
    /// so the node answers even while not primary.
    pub(crate) fn update_command_with_read_pref(
        &self,
        server_address: &ServerAddress,
        command: &mut crate::conn::Command,
        criteria: Option<&crate::selection_criteria::SelectionCriteria>,
    ) {
        use crate::selection_criteria::{ReadPreference, SelectionCriteria};

        let server_type = self
            .get_server_description(server_address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);

        match (self.topology_type, server_type) {
            (TopologyType::Sharded, ServerType::Mongos) | (TopologyType::LoadBalanced, _) => {
                if let Some(SelectionCriteria::ReadPreference(read_preference)) = criteria {
                    if !matches!(read_preference, ReadPreference::Primary) {
                        command.set_read_preference(read_preference);
                    }
                }
            }
            (TopologyType::Single, ServerType::Standalone) => {}
            (TopologyType::Single, _) => {
                let resolved = match criteria.and_then(SelectionCriteria::as_read_pref) {
                    Some(ReadPreference::Primary) | None => ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    },
                    Some(other) => other.clone(),
                };
                command.set_read_preference(&resolved);
            }
            _ => {
                if let Some(SelectionCriteria::ReadPreference(read_preference)) = criteria {
                    if !matches!(read_preference, ReadPreference::Primary) {
                        command.set_read_preference(read_preference);
                    }
                }
            }
        }
    }

    /// Sets the topology's cluster time to the provided one if it is higher
    /// than the currently recorded one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() >= Some(cluster_time) {
            return;
        }
        self.cluster_time = Some(cluster_time.clone());
    }

    /// Check the cluster for a compatibility error, and record the error
    /// message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            let error_message = server.compatibility_error_message();

            if error_message.is_some() {
                self.compatibility_error = error_message;
                return;
            }
        }
    }

    /// Updates the topology's logical session timeout based on the server's
    /// value for it. If any data-bearing server has no value, the topology's
    /// value is cleared.
    fn update_logical_session_timeout(&mut self, server_description: &ServerDescription) {
        if !server_description.server_type.is_data_bearing() {
            return;
        }
        match server_description.logical_session_timeout().ok().flatten() {
            Some(new_timeout) => match self.logical_session_timeout {
                Some(current_timeout) => {
                    self.logical_session_timeout =
                        Some(std::cmp::min(current_timeout, new_timeout));
                }
                None => {
                    let min_timeout = self
                        .servers
                        .values()
                        .filter(|s| s.server_type.is_data_bearing())
                        .map(|s| s.logical_session_timeout().ok().flatten())
                        .min()
                        .flatten();
                    self.logical_session_timeout = min_timeout;
                }
            },
            None => self.logical_session_timeout = None,
        }
    }

    /// Syncs the set of servers in the description to those in `hosts`.
    /// Servers not already present in the topology will be added, and servers
    /// in the topology not present in the set will be removed.
    pub(crate) fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) {
        self.servers.retain(|host, _| hosts.contains(host));
        for host in hosts {
            if !self.servers.contains_key(&host) {
                self.servers
                    .insert(host.clone(), ServerDescription::new(&host));
            }
        }
    }

    /// Update the topology based on the new information contained by the
    /// ServerDescription.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        // A monitor may deliver an update for an address that has since been
        // removed from the topology; those are ignored.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        if let Some(expected_name) = &self.set_name {
            if self.topology_type == TopologyType::Single && server_description.is_available() {
                let got_name = server_description.set_name();
                if !matches!(
                    got_name.as_ref().map(|opt| opt.as_deref()),
                    Ok(Some(name)) if name == expected_name
                ) {
                    let got_display = match got_name {
                        Ok(Some(s)) => format!("{:?}", s),
                        Ok(None) => "<none>".to_string(),
                        Err(s) => format!("<error: {}>", s),
                    };
                    // Mark the server as Unknown; a fresh check will follow.
                    server_description = ServerDescription::new_from_error(
                        &server_description.address,
                        Error::invalid_argument(format!(
                            "connection string replicaSet name {:?} does not match actual name {}",
                            expected_name, got_display,
                        )),
                    );
                }
            }
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        if let TopologyType::LoadBalanced = self.topology_type {
            // Load-balanced topologies have no real server updates.
            return Ok(());
        }

        self.update_logical_session_timeout(&server_description);

        if let Some(ref cluster_time) = server_description.cluster_time().ok().flatten() {
            self.advance_cluster_time(cluster_time);
        }

        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        self.check_compatibility();

        Ok(())
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server
    /// description. The cluster remains Sharded; a non-mongos member is
    /// removed from the topology.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server
    /// description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the
    /// server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"));
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server
    /// description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the
    /// non-primary server description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            // Members of a foreign replica set are removed.
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the
    /// non-primary server description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        Ok(())
    }

    /// Update the replica set topology description based on the RSPrimary
    /// server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if let Some(server_election_id) = server_description.election_id()? {
                if let (Some(topology_max_set_version), Some(ref topology_max_election_id)) =
                    (self.max_set_version, self.max_election_id.as_ref())
                {
                    // A stale primary: a newer (setVersion, electionId) pair
                    // has already been observed elsewhere.
                    if topology_max_set_version > server_set_version
                        || (topology_max_set_version == server_set_version
                            && **topology_max_election_id > server_election_id)
                    {
                        self.servers.insert(
                            server_description.address.clone(),
                            ServerDescription::new(&server_description.address),
                        );
                        self.record_primary_state();
                        return Ok(());
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // Any other server claiming to be primary is replaced with an Unknown
        // description, forcing a fresh check.
        for address in addresses.clone() {
            if address == server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) =
                self.servers.get(&address).map(|sd| sd.server_type)
            {
                let description = ServerDescription::new(&address);
                self.servers.insert(address, description);
            }
        }

        let known_hosts = server_description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());

        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type
    /// to ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the
    /// topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }
}

/// Validates a max staleness value: it must be at least 90 seconds and leave
/// room for a heartbeat plus the idle write period.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        hello::{HelloCommandResponse, HelloReply},
        options::ClientOptions,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn reply_for(
        addr: &ServerAddress,
        response: HelloCommandResponse,
    ) -> ServerDescription {
        ServerDescription::new_from_hello_reply(
            addr,
            HelloReply {
                server_address: addr.clone(),
                command_response: response,
                cluster_time: None,
            },
            Duration::from_millis(5),
        )
    }

    fn rs_member(set_name: &str, hosts: &[&str], primary: bool, secondary: bool) -> HelloCommandResponse {
        HelloCommandResponse {
            set_name: Some(set_name.to_string()),
            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            is_writable_primary: Some(primary),
            secondary: Some(secondary),
            min_wire_version: Some(6),
            max_wire_version: Some(17),
            logical_session_timeout_minutes: Some(30),
            ..Default::default()
        }
    }

    fn rs_topology(seeds: &[&str]) -> TopologyDescription {
        let options = ClientOptions::builder()
            .hosts(seeds.iter().map(|s| address(s)).collect::<Vec<_>>())
            .build();
        let mut description = TopologyDescription::default();
        description.initialize(&options);
        description
    }

    #[test]
    fn primary_observation_promotes_topology() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);
        assert_eq!(topology.topology_type(), TopologyType::Unknown);

        let primary = reply_for(
            &address("a:27017"),
            rs_member("rs0", &["a:27017", "b:27017", "c:27017"], true, false),
        );
        topology.update(primary).unwrap();

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("rs0"));
        // The primary's host list introduced c:27017.
        assert!(topology.servers.contains_key(&address("c:27017")));
    }

    #[test]
    fn primary_demotion_reverts_to_no_primary() {
        let mut topology = rs_topology(&["a:27017"]);
        let primary = reply_for(
            &address("a:27017"),
            rs_member("rs0", &["a:27017"], true, false),
        );
        topology.update(primary).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

        let demoted = reply_for(
            &address("a:27017"),
            rs_member("rs0", &["a:27017"], false, true),
        );
        topology.update(demoted).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn foreign_set_members_are_removed() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);
        let member = reply_for(
            &address("a:27017"),
            rs_member("rs0", &["a:27017", "b:27017"], false, true),
        );
        topology.update(member).unwrap();

        let foreign = reply_for(
            &address("b:27017"),
            rs_member("other", &["b:27017"], false, true),
        );
        topology.update(foreign).unwrap();
        assert!(!topology.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn mongos_observation_marks_topology_sharded() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);
        let mongos = reply_for(
            &address("a:27017"),
            HelloCommandResponse {
                msg: Some("isdbgrid".to_string()),
                min_wire_version: Some(6),
                max_wire_version: Some(17),
                logical_session_timeout_minutes: Some(30),
                ..Default::default()
            },
        );
        topology.update(mongos).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Sharded);

        // A non-mongos observation while Sharded demotes (removes) the server
        // but the cluster remains Sharded.
        let standalone = reply_for(&address("b:27017"), HelloCommandResponse::default());
        topology.update(standalone).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Sharded);
        assert!(!topology.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn standalone_with_single_seed_becomes_single() {
        let mut topology = rs_topology(&["a:27017"]);
        let standalone = reply_for(
            &address("a:27017"),
            HelloCommandResponse {
                min_wire_version: Some(6),
                max_wire_version: Some(17),
                ..Default::default()
            },
        );
        topology.update(standalone).unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Single);
    }

    #[test]
    fn standalone_with_multiple_seeds_is_dropped() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);
        let standalone = reply_for(&address("a:27017"), HelloCommandResponse::default());
        topology.update(standalone).unwrap();
        assert!(!topology.servers.contains_key(&address("a:27017")));
        assert_eq!(topology.topology_type(), TopologyType::Unknown);
    }

    #[test]
    fn stale_primary_is_reset_to_unknown() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);

        let newer = ObjectId::new();
        let older = ObjectId::new();
        // ObjectIds are ordered by their leading timestamp bytes; generate in
        // order and use the later one as the max election id.
        let (older, newer) = if older < newer { (older, newer) } else { (newer, older) };

        let mut primary_response = rs_member("rs0", &["a:27017", "b:27017"], true, false);
        primary_response.set_version = Some(1);
        primary_response.election_id = Some(newer);
        topology
            .update(reply_for(&address("a:27017"), primary_response))
            .unwrap();

        let mut stale_response = rs_member("rs0", &["a:27017", "b:27017"], true, false);
        stale_response.set_version = Some(1);
        stale_response.election_id = Some(older);
        topology
            .update(reply_for(&address("b:27017"), stale_response))
            .unwrap();

        assert_eq!(
            topology.servers.get(&address("b:27017")).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn replay_of_latest_update_is_idempotent() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);
        let update = reply_for(
            &address("a:27017"),
            rs_member("rs0", &["a:27017", "b:27017"], true, false),
        );

        topology.update(update.clone()).unwrap();
        let after_first = (
            topology.topology_type(),
            topology.set_name.clone(),
            topology.servers.keys().cloned().collect::<HashSet<_>>(),
        );

        topology.update(update).unwrap();
        let after_second = (
            topology.topology_type(),
            topology.set_name.clone(),
            topology.servers.keys().cloned().collect::<HashSet<_>>(),
        );

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn session_timeout_is_minimum_across_data_bearing_members() {
        let mut topology = rs_topology(&["a:27017", "b:27017"]);

        let mut first = rs_member("rs0", &["a:27017", "b:27017"], true, false);
        first.logical_session_timeout_minutes = Some(30);
        topology
            .update(reply_for(&address("a:27017"), first))
            .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        let mut second = rs_member("rs0", &["a:27017", "b:27017"], false, true);
        second.logical_session_timeout_minutes = Some(10);
        topology
            .update(reply_for(&address("b:27017"), second))
            .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(10 * 60))
        );
    }

    #[test]
    fn incompatible_wire_version_sets_compatibility_error() {
        let mut topology = rs_topology(&["a:27017"]);
        let mut response = rs_member("rs0", &["a:27017"], true, false);
        response.min_wire_version = Some(2);
        response.max_wire_version = Some(4);
        topology
            .update(reply_for(&address("a:27017"), response))
            .unwrap();
        assert!(topology.compatibility_error().is_some());
    }

    #[test]
    fn max_staleness_bounds() {
        assert!(verify_max_staleness(
            Duration::from_secs(89),
            Duration::from_secs(10)
        )
        .is_err());
        assert!(verify_max_staleness(
            Duration::from_secs(90),
            Duration::from_secs(10)
        )
        .is_ok());
        // Must also cover heartbeat + idle write period.
        assert!(verify_max_staleness(
            Duration::from_secs(95),
            Duration::from_secs(90)
        )
        .is_err());
    }
}
