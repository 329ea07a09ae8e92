//! Cluster controller.
//!
//! The controller is the single writer of the cluster control manager. Requests are decided
//! against the manager's current state, and the records they produce are appended to the record
//! log. Replies are held back until the records of the request have been committed and replayed,
//! so a caller never observes a reply before the state change it describes.
//!
//! After every committed batch a snapshot is taken at the batch's last offset, and only the most
//! recent `RETAINED_SNAPSHOTS` snapshots are kept available to readers of the `ClusterView`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream, UnboundedReceiverStream};

use crate::cluster::ClusterControlManager;
use crate::config::Config;
use crate::error::{CtlResult, ShutdownError, ShutdownResult};
use crate::log::{CommittedBatch, RecordLog};
use crate::models::{BrokerHeartbeatReply, BrokerHeartbeatRequest, BrokerRegistrationReply, BrokerRegistrationRequest, ControllerResult, MetadataRecord};
use crate::BrokerId;

/// A message bound for the cluster controller.
#[derive(Debug)]
pub enum ClusterCtlMsg {
    /// A request to register a broker.
    Register {
        request: BrokerRegistrationRequest,
        tx: oneshot::Sender<CtlResult<BrokerRegistrationReply>>,
    },
    /// A broker heartbeat.
    Heartbeat {
        request: BrokerHeartbeatRequest,
        tx: oneshot::Sender<CtlResult<BrokerHeartbeatReply>>,
    },
    /// A request to remove a broker from the cluster.
    Decommission { broker_id: BrokerId, tx: oneshot::Sender<CtlResult<()>> },
    /// A request to place the replicas of new partitions.
    PlaceReplicas {
        num_partitions: usize,
        replication_factor: i16,
        tx: oneshot::Sender<CtlResult<Vec<Vec<BrokerId>>>>,
    },
}

/// A reply which is waiting on the commit of the records of its request.
enum PendingReply {
    Register(oneshot::Sender<CtlResult<BrokerRegistrationReply>>, BrokerRegistrationReply),
    Heartbeat(oneshot::Sender<CtlResult<BrokerHeartbeatReply>>, BrokerHeartbeatReply),
    Decommission(oneshot::Sender<CtlResult<()>>),
}

impl PendingReply {
    fn complete(self) {
        match self {
            Self::Register(tx, reply) => {
                let _res = tx.send(Ok(reply));
            }
            Self::Heartbeat(tx, reply) => {
                let _res = tx.send(Ok(reply));
            }
            Self::Decommission(tx) => {
                let _res = tx.send(Ok(()));
            }
        }
    }
}

/// A controller encapsulating all logic for driving the cluster control manager.
pub struct ClusterCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The manager of all broker registration & fencing state.
    manager: ClusterControlManager,
    /// The log to which produced records are appended.
    log: Box<dyn RecordLog>,

    /// A channel of inbound client requests.
    requests_rx: ReceiverStream<ClusterCtlMsg>,
    /// A channel of batches committed to the log.
    committed_rx: UnboundedReceiverStream<CommittedBatch>,
    /// A channel used for communicating the last applied offset.
    offset_signal: watch::Sender<i64>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// Replies waiting on the commit of their records, keyed by the offset of their last record.
    pending: BTreeMap<i64, Vec<PendingReply>>,
}

impl ClusterCtl {
    /// Create a new instance.
    ///
    /// The given manager is activated, as this controller is its only writer.
    pub fn new(
        config: Arc<Config>, mut manager: ClusterControlManager, log: Box<dyn RecordLog>, committed_rx: mpsc::UnboundedReceiver<CommittedBatch>,
        shutdown_tx: broadcast::Sender<()>, requests_rx: mpsc::Receiver<ClusterCtlMsg>,
    ) -> (Self, watch::Receiver<i64>) {
        manager.activate();
        let (offset_signal, offset_signal_rx) = watch::channel(manager.last_applied_offset());
        (
            Self {
                config,
                manager,
                log,
                requests_rx: ReceiverStream::new(requests_rx),
                committed_rx: UnboundedReceiverStream::new(committed_rx),
                offset_signal,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
                pending: BTreeMap::new(),
            },
            offset_signal_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(node_id = self.config.node_id, "cluster controller has started");
        let mut liveness_checks = IntervalStream::new(tokio::time::interval(self.config.liveness_check_interval()));

        let res = loop {
            // Committed batches are always applied before new requests are decided.
            let res = tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break Ok(()),
                Some(batch) = self.committed_rx.next() => self.handle_committed_batch(batch),
                msg_opt = self.requests_rx.next() => self.handle_ctl_msg(msg_opt),
                _ = liveness_checks.next() => self.handle_liveness_check(),
            };
            if let Err(err) = res {
                tracing::error!(error = ?err, "fatal error in cluster controller, shutting down");
                let _res = self.shutdown_tx.send(());
                break Err(err);
            }
        };

        self.manager.deactivate();
        tracing::debug!(node_id = self.config.node_id, "cluster controller has shutdown");
        res
    }

    /// Handle a cluster controller message.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    fn handle_ctl_msg(&mut self, msg_opt: Option<ClusterCtlMsg>) -> Result<()> {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return Ok(());
            }
        };
        match msg {
            ClusterCtlMsg::Register { request, tx } => {
                let epoch = self.log.next_offset();
                let res = self.manager.register_broker(request, epoch);
                self.commit_or_reply(res, tx, PendingReply::Register)
            }
            ClusterCtlMsg::Heartbeat { request, tx } => {
                let last_committed = self.manager.last_applied_offset();
                // A broker may finish a controlled shutdown once it has caught up on all metadata.
                let shutdown_ready = request.current_metadata_offset >= last_committed;
                let res = self.manager.process_broker_heartbeat(request, last_committed, shutdown_ready);
                self.commit_or_reply(res, tx, PendingReply::Heartbeat)
            }
            ClusterCtlMsg::Decommission { broker_id, tx } => {
                let res = self.manager.decommission_broker(broker_id);
                self.commit_or_reply(res, tx, |tx, _| PendingReply::Decommission(tx))
            }
            ClusterCtlMsg::PlaceReplicas {
                num_partitions,
                replication_factor,
                tx,
            } => {
                let _res = tx.send(self.manager.place_replicas(num_partitions, replication_factor));
                Ok(())
            }
        }
    }

    /// Append the records of the given result to the log, deferring the reply until they are
    /// committed. Results without records, and errors, are replied to immediately.
    fn commit_or_reply<T>(
        &mut self, res: CtlResult<ControllerResult<T>>, tx: oneshot::Sender<CtlResult<T>>, pending: impl FnOnce(oneshot::Sender<CtlResult<T>>, T) -> PendingReply,
    ) -> Result<()> {
        let result = match res {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(error = ?err, "rejecting cluster controller request");
                let _res = tx.send(Err(err));
                return Ok(());
            }
        };
        if result.records.is_empty() {
            let _res = tx.send(Ok(result.response));
            return Ok(());
        }
        let last_offset = self.append(result.records)?;
        self.pending.entry(last_offset).or_default().push(pending(tx, result.response));
        Ok(())
    }

    /// Sweep for brokers whose session has expired, fencing them.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_liveness_check(&mut self) -> Result<()> {
        if !self.manager.is_active() {
            return Ok(());
        }
        let result = match self.manager.fence_stale_brokers() {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = ?err, "error sweeping for stale brokers");
                return Ok(());
            }
        };
        if !result.response.is_empty() {
            tracing::info!(brokers = ?result.response, "fencing brokers with expired sessions");
            self.append(result.records)?;
        }
        Ok(())
    }

    /// Replay a committed batch, snapshot the result, and complete any replies it unblocks.
    ///
    /// **NOTE: any error returned from this routine will cause a shutdown to be issued.**
    #[tracing::instrument(level = "trace", skip(self, batch))]
    fn handle_committed_batch(&mut self, batch: CommittedBatch) -> Result<()> {
        self.apply_batch(&batch)
            .with_context(|| format!("error applying committed batch {}..={}", batch.base_offset, batch.last_offset))?;
        self.retire_snapshots();

        let _res = self.offset_signal.send(batch.last_offset);

        let still_pending = self.pending.split_off(&(batch.last_offset + 1));
        for reply in std::mem::replace(&mut self.pending, still_pending).into_values().flatten() {
            reply.complete();
        }
        Ok(())
    }

    /// Replay every record of the batch, then snapshot the state at the batch's last offset.
    fn apply_batch(&mut self, batch: &CommittedBatch) -> ShutdownResult<()> {
        for (offset, record) in batch.iter() {
            tracing::trace!(offset, broker_id = record.broker_id(), "replaying committed record");
            self.manager.replay(record, offset)?;
        }
        self.manager.create_snapshot(batch.last_offset)?;
        Ok(())
    }

    /// Delete all but the most recent retained snapshots.
    fn retire_snapshots(&mut self) {
        let snapshots = self.manager.view().snapshots();
        if snapshots.len() <= self.config.retained_snapshots {
            return;
        }
        let oldest_retained = snapshots[snapshots.len() - self.config.retained_snapshots];
        self.manager.delete_snapshots_up_to(oldest_retained);
    }

    /// Append records to the log, returning the offset of the last record.
    fn append(&mut self, records: Vec<MetadataRecord>) -> Result<i64> {
        let num_records = records.len();
        let last_offset = self
            .log
            .append(records)
            .map_err(ShutdownError)
            .context("error appending records to the log")?;
        tracing::debug!(num_records, last_offset, "appended records to the log");
        Ok(last_offset)
    }
}

/// Send a request to the cluster controller, awaiting its reply.
pub async fn request<T>(requests_tx: &mpsc::Sender<ClusterCtlMsg>, msg: impl FnOnce(oneshot::Sender<CtlResult<T>>) -> ClusterCtlMsg) -> Result<CtlResult<T>> {
    let (tx, rx) = oneshot::channel();
    requests_tx
        .send(msg(tx))
        .await
        .ok()
        .context("error sending request to cluster controller, the controller is no longer running")?;
    rx.await.context("error awaiting reply from cluster controller")
}
