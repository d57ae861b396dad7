use crate::error::PublishError;
use crate::home_assistant::{PAYLOAD_AVAILABLE, PAYLOAD_NOT_AVAILABLE};
use crate::mqtt::{Message, Publisher};
use log::{debug, info};
use strum_macros::{Display, EnumIter};

/// Availability of the UPS as announced on the availability topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Availability {
    /// The last fetch succeeded
    #[strum(serialize = "online")]
    Online,

    /// The last fetch failed
    #[strum(serialize = "offline")]
    Offline,
}

impl Availability {
    /// Payload published on the availability topic
    pub fn payload(&self) -> &'static str {
        match self {
            Availability::Online => PAYLOAD_AVAILABLE,
            Availability::Offline => PAYLOAD_NOT_AVAILABLE,
        }
    }
}

/// Publishes the availability of the UPS when it changes
///
/// The recorded state only moves once the broker accepted the message, so a failed publish
/// is attempted again on the next signal with the same target.
#[derive(Debug)]
pub struct AvailabilityTracker {
    topic: String,
    last_published: Option<Availability>,
}

impl AvailabilityTracker {
    /// Creates a tracker with nothing published yet
    pub fn new(topic: &str) -> AvailabilityTracker {
        AvailabilityTracker {
            topic: topic.to_string(),
            last_published: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last state accepted by the broker, `None` before the first publish
    pub fn last_published(&self) -> Option<Availability> {
        self.last_published
    }

    /// Tells if signaling `target` would publish something
    pub fn needs_publish(&self, target: Availability) -> bool {
        self.last_published != Some(target)
    }

    /// Message announcing `target`
    pub fn message(&self, target: Availability) -> Message {
        Message::retained(&self.topic, target.payload())
    }

    /// Signals the outcome of a fetch
    ///
    /// Returns `true` if a message was published.
    pub async fn signal<P: Publisher>(
        &mut self,
        publisher: &P,
        target: Availability,
    ) -> Result<bool, PublishError> {
        if !self.needs_publish(target) {
            debug!("UPS still {target}, nothing to publish");
            return Ok(false);
        }

        publisher.publish(self.message(target)).await?;
        info!("UPS is now {target}");
        self.last_published = Some(target);
        Ok(true)
    }

    /// Publishes `target` whatever was published before
    pub async fn force<P: Publisher>(
        &mut self,
        publisher: &P,
        target: Availability,
    ) -> Result<(), PublishError> {
        publisher.publish(self.message(target)).await?;
        self.last_published = Some(target);
        Ok(())
    }
}
