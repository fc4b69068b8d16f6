//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::debug;

use super::{Connection, Ending, Link};
use crate::protocol::{Packet, ProtocolError, Subscribe, Unsubscribe};
use crate::transport::Transport;

impl<S: Transport> Connection<S> {
    /// Register the filters, queue the SUBACK, then queue retained replay.
    /// The writer drains control before data, so the SUBACK always leaves
    /// first.
    pub(crate) async fn handle_subscribe(
        &mut self,
        link: &Link,
        subscribe: Subscribe,
    ) -> Result<Option<Ending>, ProtocolError> {
        if subscribe.subscriptions.is_empty() {
            return Err(ProtocolError::violation("SUBSCRIBE without topic filters"));
        }
        let outcome = self.dispatcher.subscribe(&link.session, subscribe).await;
        link.session.enqueue_control(Packet::SubAck(outcome.suback));

        let replayed = self
            .dispatcher
            .replay_retained(&link.session, &outcome.replay);
        if replayed > 0 {
            debug!(replayed, "queued retained messages");
        }
        Ok(None)
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        link: &Link,
        unsubscribe: Unsubscribe,
    ) -> Result<Option<Ending>, ProtocolError> {
        if unsubscribe.filters.is_empty() {
            return Err(ProtocolError::violation("UNSUBSCRIBE without topic filters"));
        }
        let unsuback = self.dispatcher.unsubscribe(&link.session, unsubscribe).await;
        link.session.enqueue_control(Packet::UnsubAck(unsuback));
        Ok(None)
    }
}
