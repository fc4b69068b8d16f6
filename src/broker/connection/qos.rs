//! QoS 1/2 acknowledgement handling

use super::{Connection, Ending, Link};
use crate::protocol::{Packet, ProtocolError};
use crate::transport::Transport;

impl<S: Transport> Connection<S> {
    /// PUBACK, PUBREC, PUBREL and PUBCOMP. Replies (PUBREL, PUBCOMP) go on
    /// the control partition.
    pub(crate) fn handle_ack(
        &mut self,
        link: &Link,
        packet: Packet,
    ) -> Result<Option<Ending>, ProtocolError> {
        let reply = self
            .dispatcher
            .on_ack_received(&link.session, packet)
            .map_err(|e| e.with_connection(self.id).with_client(link.client_id.clone()))?;
        if let Some(reply) = reply {
            link.session.enqueue_control(reply);
        }
        Ok(None)
    }
}
