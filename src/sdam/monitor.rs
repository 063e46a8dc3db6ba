use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use super::{
    description::server::ServerDescription,
    topology::WeakTopologyUpdater,
    TopologyWatcher,
    DEFAULT_HEARTBEAT_FREQUENCY,
    MIN_HEARTBEAT_FREQUENCY,
};
use crate::{
    conn::{Connection, Handshaker},
    error::{Error, Result},
    hello::{hello_command, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
};

/// The weight the latest sample contributes to the round-trip-time moving
/// average.
const RTT_EWMA_WEIGHT: f64 = 0.2;

/// Monitor that performs regular heartbeats to determine server status.
///
/// One monitor task runs per known address, on its own dedicated connection,
/// concurrently with (and never blocking) the data path.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    handshaker: Handshaker,
    topology_updater: WeakTopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_requests: watch::Receiver<()>,
    average_round_trip_time: Option<Duration>,
    options: ClientOptions,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: WeakTopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_requests: watch::Receiver<()>,
        options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            handshaker: Handshaker::new(&options),
            topology_updater,
            topology_watcher,
            check_requests,
            average_round_trip_time: None,
            options,
        };
        runtime::spawn(monitor.execute())
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.is_alive() {
            self.check_server().await;

            // The floor prevents a flood of immediate-check requests from
            // hammering a server.
            tokio::time::sleep(MIN_HEARTBEAT_FREQUENCY).await;

            let remaining = heartbeat_frequency.saturating_sub(MIN_HEARTBEAT_FREQUENCY);
            let _ = tokio::time::timeout(remaining, self.check_requests.changed()).await;
        }

        debug!(address = %self.address, "monitor stopping");
    }

    /// Whether the topology still exists and still contains this monitor's
    /// address.
    fn is_alive(&self) -> bool {
        self.topology_updater.upgrade().is_some()
            && self.topology_watcher.is_alive()
            && self.topology_watcher.monitors_address(&self.address)
    }

    /// Checks the server by running a hello command. On a network error the
    /// monitoring connection is replaced; one immediate retry is performed if
    /// the server was available beforehand, so that a single dropped
    /// monitoring socket does not mark a healthy server Unknown.
    async fn check_server(&mut self) {
        // Requests that arrived before this check are satisfied by it.
        self.check_requests.borrow_and_update();

        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previously_available = self
                    .topology_watcher
                    .server_description(&self.address)
                    .map(|sd| sd.is_available())
                    .unwrap_or(false);
                if e.is_network_error() && previously_available {
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        // If the topology is gone, there is nothing left to publish to.
        let updater = match self.topology_updater.upgrade() {
            Some(updater) => updater,
            None => return,
        };

        match check_result {
            Ok(reply) => {
                let description = ServerDescription::new_from_hello_reply(
                    &self.address,
                    reply,
                    self.average_round_trip_time
                        .unwrap_or_default(),
                );
                updater.update(description);
            }
            Err(e) => {
                self.average_round_trip_time = None;
                updater.handle_monitor_error(&self.address, e);
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn
                    .stream_description()
                    .ok()
                    .map(|sd| sd.hello_ok);
                let command = hello_command(hello_ok);
                let address = conn.address.clone();
                conn.send_hello(command)
                    .await
                    .and_then(|body| HelloReply::parse(address, body))
            }
            None => {
                let connect = async {
                    let mut connection = Connection::connect(
                        self.address.clone(),
                        0,
                        0,
                        self.options.connect_timeout,
                        self.options.socket_timeout,
                    )
                    .await?;
                    let reply = self.handshaker.handshake(&mut connection).await?;
                    Ok::<_, Error>((connection, reply))
                };
                match connect.await {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(reply) => {
                self.observe_round_trip_time(start.elapsed());
                Ok(reply)
            }
            Err(e) => {
                self.connection.take();
                Err(e)
            }
        }
    }

    /// Feeds a sample into the round-trip-time moving average. The first
    /// sample seeds the average directly.
    fn observe_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(average) => Duration::from_secs_f64(
                RTT_EWMA_WEIGHT * sample.as_secs_f64()
                    + (1.0 - RTT_EWMA_WEIGHT) * average.as_secs_f64(),
            ),
            None => sample,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_rtt_sample_seeds_the_average() {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::default()])
            .build();
        let topology = crate::sdam::Topology::new(options.clone()).unwrap();
        let state = topology.watcher().latest();
        let server = state.servers.values().next().unwrap();

        let mut monitor = Monitor {
            address: ServerAddress::default(),
            connection: None,
            handshaker: Handshaker::new(&options),
            topology_updater: topology.updater().downgrade(),
            topology_watcher: topology.watcher().clone(),
            check_requests: server.subscribe_check_requests(),
            average_round_trip_time: None,
            options,
        };

        monitor.observe_round_trip_time(Duration::from_millis(100));
        assert_eq!(
            monitor.average_round_trip_time,
            Some(Duration::from_millis(100))
        );

        // 0.2 * 50ms + 0.8 * 100ms = 90ms
        monitor.observe_round_trip_time(Duration::from_millis(50));
        let average = monitor.average_round_trip_time.unwrap();
        assert!((average.as_secs_f64() - 0.090).abs() < 1e-6);
    }
}
