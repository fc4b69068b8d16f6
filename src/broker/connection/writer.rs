//! Writer task
//!
//! Drains the session's packet bus onto the write half of the transport.
//! Packets ready at the same time are encoded into one buffer and written
//! together. Ack timers start only once a packet is actually written.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::ConnectionError;
use crate::broker::stopped;
use crate::codec::Encoder;
use crate::protocol::Packet;
use crate::session::{BusItem, Completion, Session};

const MAX_BATCH: usize = 64;
const WRITE_BUF_CAPACITY: usize = 16 * 1024;

pub(crate) struct WriterHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ConnectionError>>>,
}

pub(crate) fn spawn<W>(io: W, session: Arc<Session>, encoder: Encoder) -> WriterHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(io, session, encoder, stop_rx));
    WriterHandle {
        stop,
        task: Some(task),
    }
}

impl WriterHandle {
    /// Resolves when the writer task exits on its own
    pub(crate) async fn finished(&mut self) {
        match self.task.as_mut() {
            Some(task) => {
                match task.await {
                    Ok(Ok(())) => debug!("writer finished"),
                    Ok(Err(e)) => debug!("writer failed: {}", e),
                    Err(e) => warn!("writer task failed: {}", e),
                }
                self.task = None;
            }
            None => std::future::pending().await,
        }
    }

    /// Stop the writer. With `drain`, it first gets `grace` to write what
    /// is queued up to and including a DISCONNECT.
    pub(crate) async fn close(mut self, drain: bool, grace: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        if !drain {
            let _ = self.stop.send(true);
        }
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            trace!("writer did not drain in time");
            let _ = self.stop.send(true);
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

async fn run<W>(
    mut io: W,
    session: Arc<Session>,
    mut encoder: Encoder,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(WRITE_BUF_CAPACITY);
    let mut batch: Vec<BusItem> = Vec::with_capacity(MAX_BATCH);

    loop {
        let first = tokio::select! {
            biased;

            _ = stopped(&mut stop) => break,
            item = session.bus().dequeue() => match item {
                Some(item) => item,
                None => break,
            },
        };
        batch.push(first);
        while batch.len() < MAX_BATCH && !batch.last().is_some_and(ends_connection) {
            match session.bus().try_dequeue() {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        buf.clear();
        let mut encoded = Vec::with_capacity(batch.len());
        for item in batch.drain(..) {
            let mark = buf.len();
            match encoder.encode(&item.packet, &mut buf) {
                Ok(()) => encoded.push(item),
                Err(e) => {
                    buf.truncate(mark);
                    warn!(packet_type = ?item.packet.packet_type(), "dropping unencodable packet: {}", e);
                    item.complete(Completion::Dropped);
                }
            }
        }

        if let Err(e) = io.write_all(&buf).await {
            for item in encoded {
                item.complete(Completion::Abandoned);
            }
            return Err(e.into());
        }

        let now = Instant::now();
        let mut disconnect_sent = false;
        for item in encoded {
            session.on_packet_written(&item.packet, now);
            disconnect_sent |= ends_connection(&item);
            trace!(packet_type = ?item.packet.packet_type(), "sent");
            item.complete(Completion::Delivered);
        }
        if disconnect_sent {
            break;
        }
    }

    let _ = io.flush().await;
    let _ = io.shutdown().await;
    Ok(())
}

fn ends_connection(item: &BusItem) -> bool {
    matches!(item.packet, Packet::Disconnect(_))
}
