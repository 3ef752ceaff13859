//! Pod watch stream feeding the target set
//!
//! Consumes the shared pod watch stream for the whole cluster and keeps the
//! target set current. The stream library owns reconnection: on every
//! (re)initialization it replays the full current list, which is harmless
//! because upserts are idempotent. The first completed initialization is
//! signalled to the caller so scheduling only starts against a loaded set.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::target::TargetSet;

/// Watches all pods and mutates the target set on add/update/delete
pub struct PodWatcher {
    client: Client,
    targets: Arc<TargetSet>,
}

impl PodWatcher {
    /// Create a watcher over the given client and target set
    pub fn new(client: Client, targets: Arc<TargetSet>) -> Self {
        Self { client, targets }
    }

    /// Run the watch loop until cancelled
    ///
    /// `synced` fires once the initial pod list has been applied. Transient
    /// stream failures are logged and retried with backoff by the stream
    /// itself; this loop only ends on cancellation or stream termination.
    pub async fn run(&self, synced: oneshot::Sender<()>, cancel: CancellationToken) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let stream = watcher(pods, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        let mut synced = Some(synced);
        info!("pod watcher starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pod watcher stopping");
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => handle_event(&self.targets, event, &mut synced),
                    Some(Err(e)) => {
                        warn!(error = %e, "pod watch stream error, backing off");
                    }
                    None => {
                        warn!("pod watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Apply one watch event to the target set
///
/// Delete events carry the last-known pod; when it has no usable address the
/// entry is removed by identity instead.
fn handle_event(targets: &TargetSet, event: Event<Pod>, synced: &mut Option<oneshot::Sender<()>>) {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) => targets.upsert(&pod),
        Event::Delete(pod) => {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            info!(pod = %format_args!("{namespace}/{name}"), "received pod delete event");

            let has_ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .map(|ip| !ip.is_empty())
                .unwrap_or(false);

            if has_ip {
                targets.delete(&pod);
            } else {
                targets.delete_by_identity(namespace, name);
            }
        }
        Event::Init => debug!("pod watch (re)initializing"),
        Event::InitDone => match synced.take() {
            Some(tx) => {
                info!("initial pod list synced");
                let _ = tx.send(());
            }
            None => debug!("pod watch resync complete"),
        },
    }
}
