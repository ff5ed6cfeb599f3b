//! Result Gateway.
//!
//! Accepts submissions and hands each waiting caller the result for its own
//! tracking id. One bus subscription to `result-available` feeds an
//! in-process broadcast; every caller filters that broadcast by tracking id.
//! The forwarder task owns the only sender, so callers see their streams end
//! when the upstream subscription does.

pub mod http;

use std::sync::{Arc, Weak};

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator;
use crate::events::{keys, ResultAvailable};
use crate::model::{AnalysisResult, ChangeSubmission, TrackingId};
use crate::substrate::{Substrate, SubstrateError};

const RESULT_CHANNEL_CAPACITY: usize = 256;

pub struct Gateway {
    substrate: Substrate,
    results: Weak<broadcast::Sender<Arc<ResultAvailable>>>,
    forwarder: JoinHandle<()>,
}

impl Gateway {
    /// Subscribe to results and start forwarding them to callers.
    pub async fn start(substrate: Substrate) -> Result<Self, SubstrateError> {
        let mut upstream = substrate.bus.subscribe::<ResultAvailable>().await?;
        let (tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let tx = Arc::new(tx);
        let results = Arc::downgrade(&tx);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = upstream.next().await {
                debug!(tracking_id = %event.tracking_id, "result received");
                // No waiting caller is fine; the cache covers late joiners.
                let _ = tx.send(Arc::new(event));
            }
            warn!("result subscription closed");
        });
        Ok(Self {
            substrate,
            results,
            forwarder,
        })
    }

    pub async fn submit(&self, submission: ChangeSubmission) -> Result<TrackingId, SubstrateError> {
        coordinator::enqueue(&self.substrate, submission).await
    }

    /// Results for `tracking_id` only. Dropping the stream unsubscribes.
    /// The stream is empty once the forwarder has stopped.
    pub fn subscribe(&self, tracking_id: TrackingId) -> BoxStream<'static, AnalysisResult> {
        let Some(tx) = self.results.upgrade() else {
            debug!(%tracking_id, "result forwarder stopped");
            return stream::empty().boxed();
        };
        let rx = tx.subscribe();
        drop(tx);
        stream::unfold((rx, tracking_id), |(mut rx, id)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.tracking_id == id => {
                        let result = event.result.clone();
                        return Some((result, (rx, id)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(tracking_id = %id, skipped, "result waiter lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Result previously cached by the coordinator, if it has not expired.
    pub async fn cached_result(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<AnalysisResult>, SubstrateError> {
        match self.substrate.kv.get(&keys::result(tracking_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Wait for the single result of `tracking_id`.
    ///
    /// Subscribes before consulting the cache so a result published in
    /// between is not missed. `None` means the gateway is shutting down.
    pub async fn wait_for(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<AnalysisResult>, SubstrateError> {
        let mut live = self.subscribe(tracking_id.clone());
        if let Some(result) = self.cached_result(tracking_id).await? {
            return Ok(Some(result));
        }
        Ok(live.next().await)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::model::Metrics;
    use crate::substrate::{memory, EventBus, MessageBus, RawSubscription, SubstrateResult};

    fn result(summary: &str) -> AnalysisResult {
        AnalysisResult {
            change_summary: summary.into(),
            affected_components: vec![],
            tasks: vec![],
            risks: vec![],
            keywords: Default::default(),
            overall_description: String::new(),
            tracker_ids: vec![],
            metrics: Metrics::default(),
        }
    }

    async fn publish(substrate: &Substrate, id: &str, summary: &str) {
        substrate
            .bus
            .publish(&ResultAvailable {
                tracking_id: id.into(),
                result: result(summary),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn each_caller_sees_only_its_own_result() {
        let substrate = Substrate::in_memory();
        let gateway = Gateway::start(substrate.clone()).await.unwrap();
        let mut a = gateway.subscribe("a".into());
        let mut b = gateway.subscribe("b".into());

        publish(&substrate, "b", "for b").await;
        publish(&substrate, "c", "for nobody").await;
        publish(&substrate, "a", "for a").await;

        assert_eq!(a.next().await.unwrap().change_summary, "for a");
        assert_eq!(b.next().await.unwrap().change_summary, "for b");
        let more = tokio::time::timeout(Duration::from_millis(50), b.next()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn callers_with_same_id_all_receive() {
        let substrate = Substrate::in_memory();
        let gateway = Gateway::start(substrate.clone()).await.unwrap();
        let mut first = gateway.subscribe("x".into());
        let mut second = gateway.subscribe("x".into());

        publish(&substrate, "x", "shared").await;
        assert_eq!(first.next().await.unwrap().change_summary, "shared");
        assert_eq!(second.next().await.unwrap().change_summary, "shared");
    }

    #[tokio::test]
    async fn wait_for_uses_cache_when_result_already_published() {
        let substrate = Substrate::in_memory();
        let gateway = Gateway::start(substrate.clone()).await.unwrap();
        let id = TrackingId::from("done");
        substrate
            .kv
            .set(
                &keys::result(&id),
                &serde_json::to_string(&result("cached")).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let got = gateway.wait_for(&id).await.unwrap().unwrap();
        assert_eq!(got.change_summary, "cached");
    }

    #[tokio::test]
    async fn wait_for_blocks_until_published() {
        let substrate = Substrate::in_memory();
        let gateway = Arc::new(Gateway::start(substrate.clone()).await.unwrap());
        let waiter = {
            let g = gateway.clone();
            tokio::spawn(async move { g.wait_for(&"later".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        publish(&substrate, "later", "arrived").await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.change_summary, "arrived");
    }

    /// Bus whose subscriptions end immediately.
    struct ClosedBus;

    #[async_trait::async_trait]
    impl MessageBus for ClosedBus {
        async fn publish(&self, _topic: &str, _payload: String) -> SubstrateResult<()> {
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> SubstrateResult<RawSubscription> {
            Ok(stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn waiters_end_when_upstream_closes() {
        let substrate = Substrate {
            queue: Arc::new(memory::MemoryQueue::new()),
            bus: EventBus::new(Arc::new(ClosedBus)),
            kv: Arc::new(memory::MemoryStore::new()),
        };
        let gateway = Gateway::start(substrate).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), gateway.wait_for(&"gone".into()))
            .await
            .expect("waiter should not hang")
            .unwrap();
        assert!(got.is_none());
        let mut late = gateway.subscribe("gone".into());
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn submit_enqueues_for_coordinator() {
        let substrate = Substrate::in_memory();
        let gateway = Gateway::start(substrate.clone()).await.unwrap();
        gateway
            .submit(ChangeSubmission::new("old", "new"))
            .await
            .unwrap();
        assert_eq!(
            substrate
                .queue
                .len(crate::events::SUBMISSION_QUEUE)
                .await
                .unwrap(),
            1
        );
    }
}
