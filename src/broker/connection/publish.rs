//! PUBLISH handling

use tracing::debug;

use super::{Connection, Ending, Link};
use crate::broker::dispatcher::PublishResult;
use crate::protocol::{ProtocolError, Publish};
use crate::transport::Transport;

impl<S: Transport> Connection<S> {
    /// Hand an inbound PUBLISH to the dispatcher and queue its
    /// acknowledgement
    pub(crate) async fn handle_publish(
        &mut self,
        link: &Link,
        publish: Publish,
    ) -> Result<Option<Ending>, ProtocolError> {
        let reply = self
            .dispatcher
            .on_publish_received(&link.session, publish)
            .await
            .map_err(|e| e.with_connection(self.id).with_client(link.client_id.clone()))?;

        if let Some(ack) = reply.ack {
            link.session.enqueue_control(ack);
        }
        match reply.result {
            PublishResult::Close(reason) => {
                debug!(%reason, "closing publisher");
                Ok(Some(Ending::Policy(reason)))
            }
            _ => Ok(None),
        }
    }
}
