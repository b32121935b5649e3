//! Challenge index
//!
//! In-memory mirror of every cert-manager `Challenge` in the cluster, fed by
//! a kube watcher. The facade looks challenges up here by `(dnsName, key)`
//! instead of hitting the API server on every request. Deletions are pushed
//! onto a queue so the provider cache can drop the matching provider.

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::resources::Challenge;
use super::types::{ProviderKey, SolverError};

/// Pause before polling the watch again after an error
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

type ObjectRef = (String, String);

fn object_ref(challenge: &Challenge) -> ObjectRef {
    (challenge.namespace().unwrap_or_default(), challenge.name_any())
}

pub struct ChallengeIndex {
    challenges: RwLock<HashMap<ObjectRef, Challenge>>,
    deletions: mpsc::UnboundedSender<ProviderKey>,
}

impl ChallengeIndex {
    /// Create an empty index and the receiving end of its deletion queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProviderKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = Self {
            challenges: RwLock::new(HashMap::new()),
            deletions: tx,
        };
        (index, rx)
    }

    /// Find the DNS-01 challenge for `dns_name` whose key equals `digest`
    pub fn lookup(&self, dns_name: &str, digest: &str) -> Result<Challenge, SolverError> {
        self.challenges
            .read()
            .values()
            .find(|ch| ch.is_dns01() && ch.spec.dns_name == dns_name && ch.spec.key == digest)
            .cloned()
            .ok_or_else(|| SolverError::NotFound(format!("challenge for {}", dns_name)))
    }

    pub fn len(&self) -> usize {
        self.challenges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.read().is_empty()
    }

    /// Apply one watch event to the mirror
    pub fn apply(&self, event: Event<Challenge>) {
        match event {
            Event::Applied(challenge) => {
                debug!(
                    name = %challenge.name_any(),
                    dns_name = %challenge.spec.dns_name,
                    "Challenge applied"
                );
                let key = challenge.provider_key();
                let replaced = self.challenges.write().insert(object_ref(&challenge), challenge);
                // An update that changes the key retires the old provider
                if let Some(old) = replaced.filter(|old| old.provider_key() != key) {
                    self.notify_deleted(&old);
                }
            }
            Event::Deleted(challenge) => {
                let removed = self.challenges.write().remove(&object_ref(&challenge));
                debug!(name = %challenge.name_any(), "Challenge deleted");
                self.notify_deleted(removed.as_ref().unwrap_or(&challenge));
            }
            Event::Restarted(list) => {
                let fresh: HashMap<ObjectRef, Challenge> =
                    list.into_iter().map(|ch| (object_ref(&ch), ch)).collect();

                let previous = std::mem::replace(&mut *self.challenges.write(), fresh);
                let current = self.challenges.read();

                // Deletes and key changes missed while the watch was down
                for (obj, challenge) in &previous {
                    let kept = current
                        .get(obj)
                        .is_some_and(|now| now.provider_key() == challenge.provider_key());
                    if !kept {
                        self.notify_deleted(challenge);
                    }
                }

                info!(count = current.len(), "Challenge index resynced");
            }
        }
    }

    fn notify_deleted(&self, challenge: &Challenge) {
        if self.deletions.send(challenge.provider_key()).is_err() {
            debug!("Deletion queue closed, dropping notification");
        }
    }

    /// Watch every `Challenge` in the cluster until `shutdown` fires.
    ///
    /// `ready` receives `Ok` after the first full list, or the error that
    /// prevented it, in which case the watch gives up.
    pub async fn run_watch(
        &self,
        api: Api<Challenge>,
        ready: oneshot::Sender<Result<(), SolverError>>,
        shutdown: watch::Receiver<bool>,
    ) {
        let stream = watcher::watcher(api, watcher::Config::default()).boxed();
        self.run_stream(stream, ready, shutdown).await
    }

    pub(crate) async fn run_stream<S, E>(
        &self,
        mut stream: S,
        ready: oneshot::Sender<Result<(), SolverError>>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: Stream<Item = Result<Event<Challenge>, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut ready = Some(ready);

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.changed() => {
                    info!("Stopping challenge watch");
                    return;
                }
            };

            match next {
                Some(Ok(event)) => {
                    let synced = matches!(event, Event::Restarted(_));
                    self.apply(event);

                    if synced {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
                Some(Err(e)) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(SolverError::WatchUnavailable(e.to_string())));
                        return;
                    }

                    warn!(error = %e, "Challenge watch error, retrying");
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                None => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(SolverError::WatchUnavailable(
                            "watch ended before initial list".to_string(),
                        )));
                    }
                    warn!("Challenge watch stream ended");
                    return;
                }
            }
        }
    }
}
