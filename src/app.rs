use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::clock::SystemClock;
use crate::cluster::{ClusterControlManager, ClusterView};
use crate::config::Config;
use crate::ctl::{ClusterCtl, ClusterCtlMsg};
use crate::log::LocalLog;
use crate::placement::RandomReplicaPlacer;

/// The application object for when the cluster controller is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// A read handle over the controller's retained snapshots.
    view: ClusterView,
    /// A channel of requests bound for the cluster controller.
    requests_tx: mpsc::Sender<ClusterCtlMsg>,
    /// A channel used for communicating the controller's last applied offset.
    offset_signal: watch::Receiver<i64>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the cluster controller.
    ctl_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let placement = Box::new(RandomReplicaPlacer::new(StdRng::from_entropy()));
        let manager = ClusterControlManager::new(Arc::new(SystemClock), config.session_timeout(), placement);
        let view = manager.view();

        let (log, committed_rx) = LocalLog::new();
        let (requests_tx, requests_rx) = mpsc::channel(1000);
        let (ctl, offset_signal) = ClusterCtl::new(config.clone(), manager, Box::new(log), committed_rx, shutdown_tx.clone(), requests_rx);
        let ctl_handle = ctl.spawn();

        Self {
            _config: config,
            view,
            requests_tx,
            offset_signal,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            ctl_handle,
        }
    }

    /// A read handle over the cluster state.
    pub fn view(&self) -> ClusterView {
        self.view.clone()
    }

    /// A channel for sending requests to the cluster controller.
    pub fn requests(&self) -> mpsc::Sender<ClusterCtlMsg> {
        self.requests_tx.clone()
    }

    /// A channel which observes the offset of the last applied record.
    pub fn offset_signal(&self) -> watch::Receiver<i64> {
        self.offset_signal.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("cluster controller is shutting down");
        drop(self.requests_tx);
        if let Err(err) = self.ctl_handle.await.context("error joining cluster controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down cluster controller");
        }
        let last_applied = *self.offset_signal.borrow();
        tracing::debug!(last_applied, "cluster controller shutdown complete");
        Ok(())
    }
}
