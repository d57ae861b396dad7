use crate::apcupsd::Fetcher;
use crate::availability::{Availability, AvailabilityTracker};
use crate::catalog::Catalog;
use crate::configuration::Configuration;
use crate::error::{ConfigError, FetchError};
use crate::home_assistant::{DeviceIdentity, Topics, discovery_messages};
use crate::mqtt::{Message, Publisher};
use crate::status::{StatusMessage, UpsSnapshot, with_derived_metrics};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Daemon that periodically reads apcupsd and sends the status to MQTT
pub struct Daemon<F, P> {
    config: Configuration,
    catalog: Catalog,
    fetcher: F,
    publisher: P,
    cancel: CancellationToken,
}

/// State kept between two iterations of the main loop
struct Session {
    topics: Topics,
    registration: Vec<Message>,
    registration_pending: bool,
    availability: AvailabilityTracker,
}

impl<F: Fetcher, P: Publisher> Daemon<F, P> {
    /// Constructs a daemon from the specified configuration and collaborators
    ///
    /// ```
    /// use apcupsd_mqtt::{ApcupsdClient, Catalog, Configuration, Daemon, MqttPublisher};
    ///
    /// let config = Configuration::load("conf/apcupsd-mqtt.conf").expect("Cannot load configuration");
    /// let catalog = Catalog::load(None).expect("Cannot load catalog");
    /// let fetcher = ApcupsdClient::from_config(&config);
    /// let publisher = MqttPublisher::new(&config);
    /// let daemon = Daemon::new(config, catalog, fetcher, publisher);
    ///
    /// // later, run daemon.run() in an async function
    /// ```
    pub fn new(config: Configuration, catalog: Catalog, fetcher: F, publisher: P) -> Daemon<F, P> {
        info!(
            "Daemon starting with {} sensors, polling every {:?}",
            catalog.len(),
            config.update_period()
        );

        Daemon {
            config,
            catalog,
            fetcher,
            publisher,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the token that stops the daemon
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Daemon<F, P> {
        self.cancel = cancel;
        self
    }

    /// Token that stops the daemon once cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Runs the main loop until the cancellation token is cancelled
    ///
    /// Fetch and publish failures are logged and retried on the next period. Only an invalid
    /// sensor catalog is returned as an error.
    pub async fn run(&self) -> Result<(), ConfigError> {
        let Some(first) = self.wait_for_identity().await else {
            info!("Stopped before apcupsd answered");
            return Ok(());
        };
        let identity = DeviceIdentity::from_snapshot(&first, self.config.alias.as_deref());
        info!(
            "Found UPS {} (model {}, firmware {}) as {}",
            identity.serial_no, identity.model, identity.firmware, identity.alias
        );

        let topics = Topics::new(
            &self.config.mqtt.registration_prefix,
            &self.config.mqtt.state_prefix,
            &identity.alias,
        );
        let registration: Vec<Message> = discovery_messages(
            &topics.registration_prefix,
            &identity,
            self.catalog.sensors(),
            &topics.state,
            Some(topics.availability.as_str()),
        )?
        .iter()
        .map(|m| m.to_message())
        .collect();

        let mut session = Session {
            availability: AvailabilityTracker::new(&topics.availability),
            topics,
            registration,
            registration_pending: true,
        };

        self.main_loop(&mut session, first).await;
        self.shutdown(&mut session).await;

        Ok(())
    }

    /// Fetches snapshots until one succeeds, to read the identity of the UPS
    ///
    /// The snapshot is returned so that the first tick publishes it instead of querying again.
    async fn wait_for_identity(&self) -> Option<UpsSnapshot> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.fetcher.fetch().await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => warn!("Cannot read the UPS identity from apcupsd: {e}"),
            }
            if !self.pause(self.config.update_period()).await {
                return None;
            }
        }
    }

    async fn main_loop(&self, session: &mut Session, first: UpsSnapshot) {
        let period = self.config.update_period();
        let mut first = Some(first);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if session.registration_pending {
                self.publish_registration(session).await;
            }

            let fetched = match first.take() {
                Some(snapshot) => Ok(snapshot),
                None => self.fetcher.fetch().await,
            };
            self.publish_update(session, fetched).await;

            if !self.pause(period).await {
                debug!("Shutdown requested");
                break;
            }
        }
    }

    /// Sends the discovery messages, keeping them pending if the broker refuses them
    async fn publish_registration(&self, session: &mut Session) {
        match self.publisher.publish_many(&session.registration).await {
            Ok(()) => {
                info!(
                    "Registered {} sensors under {}",
                    session.registration.len(),
                    session.topics.registration_prefix
                );
                session.registration_pending = false;
            }
            Err(e) => error!(
                "Cannot publish the discovery messages to {}:{}, retrying next period: {e}",
                self.config.mqtt.host, self.config.mqtt.port
            ),
        }
    }

    /// Single iteration of the main loop
    async fn publish_update(&self, session: &mut Session, fetched: Result<UpsSnapshot, FetchError>) {
        let target = match fetched {
            Ok(snapshot) => {
                let status = StatusMessage::from(&with_derived_metrics(&snapshot));
                let message = Message::retained(&session.topics.state, status.to_string());
                if let Err(e) = self.publisher.publish(message).await {
                    warn!("Cannot publish to {}: {e}", session.topics.state);
                }
                Availability::Online
            }
            Err(e) => {
                warn!(
                    "Cannot fetch status from apcupsd at {}:{}: {e}",
                    self.config.apcupsd.host, self.config.apcupsd.port
                );
                Availability::Offline
            }
        };

        if let Err(e) = session.availability.signal(&self.publisher, target).await {
            warn!(
                "Cannot publish {target} to {}: {e}",
                session.availability.topic()
            );
        }
    }

    /// Announces that the UPS is no longer monitored
    async fn shutdown(&self, session: &mut Session) {
        match session
            .availability
            .force(&self.publisher, Availability::Offline)
            .await
        {
            Ok(()) => info!("Published offline status, exiting"),
            Err(e) => warn!("Cannot publish offline status while exiting: {e}"),
        }
    }

    /// Waits for `period`. Returns `false` if the daemon was cancelled meanwhile.
    async fn pause(&self, period: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = sleep(period) => true,
        }
    }
}
