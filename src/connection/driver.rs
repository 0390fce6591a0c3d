//! Per-attempt transport task
//!
//! One driver runs for each connection epoch. It opens the transport, pumps
//! outbound envelopes to it and reports everything that happens back to the
//! manager as [`TransportEvent`]s tagged with its epoch.

use crate::auth::Credential;
use crate::transport::{TransportConnector, TransportStream};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::Envelope;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Something the transport of one epoch reported
#[derive(Debug)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug)]
pub enum TransportEventKind {
    /// Transport is open and the credential has been attached
    Opened,
    /// Transport failed to open or did not open in time
    OpenFailed { reason: String },
    /// Envelope received from the peer
    Message(Envelope),
    /// Envelopes handed to a transport that died before writing them, oldest first
    Unsent { envelopes: Vec<Envelope> },
    /// Transport closed by the peer or by an I/O error
    Closed { reason: String },
}

/// Everything one driver needs besides its channels
pub struct DriverParams<C> {
    pub connector: Arc<C>,
    pub credential: Credential,
    pub epoch: u64,
    pub open_timeout: Duration,
}

struct Reporter {
    epoch: u64,
    events: mpsc::Sender<TransportEvent>,
}

impl Reporter {
    async fn report(&self, kind: TransportEventKind) {
        // Manager gone: nothing left to tell
        let _ = self
            .events
            .send(TransportEvent {
                epoch: self.epoch,
                kind,
            })
            .await;
    }

    /// Report a dead transport
    ///
    /// `unsent` plus everything still buffered goes back to the manager as one
    /// batch ahead of the close, so it can be requeued in front of newer sends.
    async fn closed(
        &self,
        outbound_rx: &mut mpsc::Receiver<Envelope>,
        mut unsent: Vec<Envelope>,
        reason: String,
    ) {
        outbound_rx.close();
        while let Ok(envelope) = outbound_rx.try_recv() {
            unsent.push(envelope);
        }
        if !unsent.is_empty() {
            self.report(TransportEventKind::Unsent { envelopes: unsent }).await;
        }
        self.report(TransportEventKind::Closed { reason }).await;
    }
}

/// Run one transport attempt until it closes or the manager tears it down
pub async fn run<C: TransportConnector>(
    params: DriverParams<C>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    mut close_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    let DriverParams {
        connector,
        credential,
        epoch,
        open_timeout,
    } = params;
    let reporter = Reporter { epoch, events };

    let opened = tokio::select! {
        _ = &mut close_rx => {
            debug!(epoch, "Open abandoned by teardown");
            return;
        }
        result = timeout(open_timeout, connector.connect(&credential)) => result,
    };

    let mut stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reporter
                .report(TransportEventKind::OpenFailed {
                    reason: format!("{:#}", e),
                })
                .await;
            return;
        }
        Err(_) => {
            reporter
                .report(TransportEventKind::OpenFailed {
                    reason: format!("{} open timed out after {:?}", connector.name(), open_timeout),
                })
                .await;
            return;
        }
    };

    debug!(epoch, transport = connector.name(), "Transport open");
    reporter.report(TransportEventKind::Opened).await;

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                if let Err(e) = stream.shutdown().await {
                    debug!(epoch, "Transport shutdown error: {}", e);
                }
                return;
            }

            Some(envelope) = outbound_rx.recv() => {
                if let Err(e) = stream.send(&envelope).await {
                    warn!(epoch, msg_type = %envelope.msg_type, "Transport write failed: {}", e);
                    let reason = format!("write failed: {}", e);
                    reporter.closed(&mut outbound_rx, vec![envelope], reason).await;
                    return;
                }
            }

            result = stream.recv() => {
                match result {
                    Ok(Some(envelope)) => {
                        reporter.report(TransportEventKind::Message(envelope)).await;
                    }
                    Ok(None) => {
                        reporter.closed(&mut outbound_rx, Vec::new(), "closed by peer".into()).await;
                        return;
                    }
                    Err(e) => {
                        reporter.closed(&mut outbound_rx, Vec::new(), format!("read error: {}", e)).await;
                        return;
                    }
                }
            }
        }
    }
}
