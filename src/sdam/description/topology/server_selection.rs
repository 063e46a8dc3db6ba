use std::time::Duration;

use rand::seq::SliceRandom;

use super::{verify_max_staleness, TopologyDescription, TopologyType};
use crate::{
    error::{ErrorKind, Result},
    sdam::{
        description::server::{ServerDescription, ServerType},
        ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// The period within which an idle primary is assumed to have had a chance to
/// write; part of the published max-staleness validation bound.
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

impl TopologyDescription {
    /// Attempts to select a server matching `criteria` from this description,
    /// returning `None` if no suitable server currently exists. The choice
    /// within the latency window is uniformly random.
    pub(crate) fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Option<&'a ServerDescription>> {
        let in_window = self.suitable_servers_in_latency_window(criteria)?;
        Ok(in_window.choose(&mut rand::thread_rng()).copied())
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.servers.values().any(ServerDescription::is_available) {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}",
                criteria
            )
        } else {
            "Server selection timeout: No available servers".to_string()
        }
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // On a direct connection, the single server is eligible
                    // regardless of whether it is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // A load balancer is never monitored and so has no RTT; it is
                // always within the window.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        tag_sets,
                        max_staleness,
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // A max staleness of zero is equivalent to no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms: i64 = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            let server_staleness =
                self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness: i64 = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        // With no primary, the freshest secondary serves as the reference
        // clock.
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| server.last_write_date().ok().flatten())
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness = self
                .calculate_secondary_staleness_without_primary(server, secondary_max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency: i64 = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency: i64 = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

/// Keeps the servers matching the first tag set that matches any server. An
/// empty list of tag sets matches everything; no matching tag set matches
/// nothing.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use bson::DateTime;

    use super::*;
    use crate::{
        hello::{HelloCommandResponse, HelloReply, LastWrite},
        options::{ClientOptions, ServerAddress},
        selection_criteria::ReadPreferenceOptions,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn topology(members: Vec<ServerDescription>) -> TopologyDescription {
        let options = ClientOptions::builder()
            .hosts(
                members
                    .iter()
                    .map(|m| m.address.clone())
                    .collect::<Vec<_>>(),
            )
            .build();
        let mut description = TopologyDescription::default();
        description.initialize(&options);
        for member in members {
            description.update(member).unwrap();
        }
        description
    }

    fn rs_member_with_last_write(
        addr: &str,
        primary: bool,
        last_write_millis_ago: i64,
        now: DateTime,
        rtt: Duration,
        tags: Option<TagSet>,
    ) -> ServerDescription {
        let addr = address(addr);
        let response = HelloCommandResponse {
            set_name: Some("rs0".to_string()),
            hosts: Some(vec!["p:27017".to_string(), "s1:27017".to_string(), "s2:27017".to_string()]),
            is_writable_primary: Some(primary),
            secondary: Some(!primary),
            min_wire_version: Some(6),
            max_wire_version: Some(17),
            logical_session_timeout_minutes: Some(30),
            last_write: Some(LastWrite {
                last_write_date: DateTime::from_millis(
                    now.timestamp_millis() - last_write_millis_ago,
                ),
            }),
            tags,
            ..Default::default()
        };
        ServerDescription::new_from_hello_reply(
            &addr,
            HelloReply {
                server_address: addr.clone(),
                command_response: response,
                cluster_time: None,
            },
            rtt,
        )
    }

    #[test]
    fn max_staleness_filters_lagging_secondaries() {
        // Primary wrote just now; s1 lags 100s; s2 lags 30s. With mode
        // secondary and maxStalenessSeconds=90, only s2 is eligible.
        let now = DateTime::now();
        let rtt = Duration::from_millis(5);
        let description = topology(vec![
            rs_member_with_last_write("p:27017", true, 0, now, rtt, None),
            rs_member_with_last_write("s1:27017", false, 100_000, now, rtt, None),
            rs_member_with_last_write("s2:27017", false, 30_000, now, rtt, None),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                max_staleness: Some(Duration::from_secs(90)),
                tag_sets: None,
            },
        });

        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        let addresses: HashSet<_> = suitable.iter().map(|s| s.address.clone()).collect();
        assert_eq!(addresses, [address("s2:27017")].into_iter().collect());
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let now = DateTime::now();
        let description = topology(vec![
            rs_member_with_last_write("p:27017", true, 0, now, Duration::from_millis(5), None),
            rs_member_with_last_write("s1:27017", false, 0, now, Duration::from_millis(10), None),
            rs_member_with_last_write("s2:27017", false, 0, now, Duration::from_millis(100), None),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });

        // Default local threshold is 15ms: 5ms and 10ms servers are in the
        // window, the 100ms server is not.
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        let addresses: HashSet<_> = suitable.iter().map(|s| s.address.clone()).collect();
        assert_eq!(
            addresses,
            [address("p:27017"), address("s1:27017")].into_iter().collect()
        );
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let now = DateTime::now();
        let rtt = Duration::from_millis(5);
        let east: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        let west: TagSet = [("dc".to_string(), "west".to_string())].into_iter().collect();

        let description = topology(vec![
            rs_member_with_last_write("p:27017", true, 0, now, rtt, None),
            rs_member_with_last_write("s1:27017", false, 0, now, rtt, Some(east.clone())),
            rs_member_with_last_write("s2:27017", false, 0, now, rtt, Some(west.clone())),
        ]);

        let nomatch: TagSet = [("dc".to_string(), "north".to_string())].into_iter().collect();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                tag_sets: Some(vec![nomatch, west]),
                max_staleness: None,
            },
        });

        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, address("s2:27017"));
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let now = DateTime::now();
        let rtt = Duration::from_millis(5);
        let description = topology(vec![
            rs_member_with_last_write("s1:27017", false, 0, now, rtt, None),
            rs_member_with_last_write("s2:27017", false, 0, now, rtt, None),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: Default::default(),
        });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 2);

        let primary_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert!(description
            .suitable_servers_in_latency_window(&primary_criteria)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_servers_are_never_selected() {
        let description = topology(vec![]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });
        assert!(description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .is_empty());
    }
}
