//! Per-session ingestion: persists batches and throttles the transport when
//! the worker runs short on memory.

use std::{collections::BTreeMap, sync::Arc};

use {
    serde_json::json,
    tracing::{debug, info, warn},
};

use {
    switchboard_config::IngestConfig,
    switchboard_protocol::{Chat, EventBatch, FlowControl},
};

use crate::{
    error::StoreError,
    events::{ApplyOutcome, EventStore},
    memory::MemorySampler,
};

/// What a backpressure tick did to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Paused,
    Resumed,
}

/// Hysteresis between a high and a low memory watermark.
///
/// Memory is sampled every `every` ticks. Above `high` the transport's read
/// side is paused; it is resumed only once the ratio drops under `low`.
#[derive(Debug, Clone)]
pub struct Backpressure {
    every: u64,
    high: f64,
    low: f64,
    ticks: u64,
}

impl Backpressure {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            every: config.sample_every.max(1),
            high: config.high_watermark,
            low: config.low_watermark(),
            ticks: 0,
        }
    }

    pub fn on_tick(
        &mut self,
        sampler: &dyn MemorySampler,
        flow: &dyn FlowControl,
    ) -> Option<FlowAction> {
        self.ticks += 1;
        if self.ticks % self.every != 0 {
            return None;
        }
        self.check(sampler, flow)
    }

    /// Sample right away, ignoring the tick count.
    pub fn check(&self, sampler: &dyn MemorySampler, flow: &dyn FlowControl) -> Option<FlowAction> {
        let ratio = sampler.sample()?.ratio();
        let paused = flow.is_paused();
        if ratio > self.high && !paused {
            flow.pause_reads();
            Some(FlowAction::Paused)
        } else if ratio < self.low && paused {
            flow.resume_reads();
            Some(FlowAction::Resumed)
        } else {
            None
        }
    }
}

/// Ingestion pipeline bound to one session's event stream.
pub struct SessionIngest {
    session_id: String,
    store: EventStore,
    sampler: Arc<dyn MemorySampler>,
    backpressure: Backpressure,
    attached: bool,
}

impl SessionIngest {
    pub fn new(
        session_id: impl Into<String>,
        store: EventStore,
        sampler: Arc<dyn MemorySampler>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            sampler,
            backpressure: Backpressure::new(config),
            attached: false,
        }
    }

    /// Start persisting store events. Returns false if already attached.
    pub fn attach(&mut self) -> bool {
        !std::mem::replace(&mut self.attached, true)
    }

    /// Stop persisting store events. Returns false if already detached.
    pub fn detach(&mut self) -> bool {
        std::mem::replace(&mut self.attached, false)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Count one event tick against the sampling interval.
    pub fn tick(&mut self, flow: &dyn FlowControl) -> Option<FlowAction> {
        let action = self.backpressure.on_tick(self.sampler.as_ref(), flow);
        self.log_action(action);
        action
    }

    /// Sample now. A paused transport delivers no ticks, so resuming has to
    /// be driven from outside the event stream.
    pub fn recheck(&self, flow: &dyn FlowControl) -> Option<FlowAction> {
        let action = self.backpressure.check(self.sampler.as_ref(), flow);
        self.log_action(action);
        action
    }

    fn log_action(&self, action: Option<FlowAction>) {
        match action {
            Some(FlowAction::Paused) => {
                warn!(session_id = %self.session_id, "memory above high watermark, pausing transport reads");
            },
            Some(FlowAction::Resumed) => {
                info!(session_id = %self.session_id, "memory back under low watermark, resuming transport reads");
            },
            None => {},
        }
    }

    /// Persist the store events of one batch.
    pub async fn process(&mut self, batch: &EventBatch) -> Result<ApplyOutcome, StoreError> {
        if !batch.has_store_events() {
            return Ok(ApplyOutcome::default());
        }
        if !self.attached {
            debug!(session_id = %self.session_id, "ingestion detached, dropping store events");
            return Ok(ApplyOutcome::default());
        }

        let mut outcome = self.store.apply(&self.session_id, batch).await?;
        if !outcome.orphan_chats.is_empty() {
            // Synthesized batches only carry chat upserts and are applied
            // directly, so they can never synthesize again.
            let synthesized = synthesize_chats(batch, &outcome.orphan_chats);
            debug!(
                session_id = %self.session_id,
                count = synthesized.chats_upsert.len(),
                "synthesizing chats for new conversations"
            );
            let extra = self.store.apply(&self.session_id, &synthesized).await?;
            outcome.rows_written += extra.rows_written;
        }
        Ok(outcome)
    }
}

/// Chat upserts for conversations first seen through `messages.upsert`.
fn synthesize_chats(batch: &EventBatch, orphans: &[String]) -> EventBatch {
    let mut stats: BTreeMap<&str, (Option<i64>, u64)> = orphans
        .iter()
        .map(|jid| (jid.as_str(), (None, 0)))
        .collect();
    for msg in &batch.messages_upsert {
        if let Some((ts, unread)) = stats.get_mut(msg.key.remote_jid.as_str()) {
            *ts = (*ts).max(msg.message_timestamp);
            if !msg.key.from_me {
                *unread += 1;
            }
        }
    }

    let chats_upsert = stats
        .into_iter()
        .map(|(jid, (ts, unread))| {
            let mut chat = Chat::new(jid);
            chat.fields.insert("unreadCount".into(), json!(unread));
            if let Some(ts) = ts {
                chat.fields.insert("conversationTimestamp".into(), json!(ts));
            }
            chat
        })
        .collect();

    EventBatch {
        chats_upsert,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use {
        serde_json::Map,
        switchboard_protocol::{Message, MessageKey},
    };

    use {super::*, crate::memory::MemorySample};

    /// Replays a fixed sequence of ratios.
    struct ScriptedSampler {
        ratios: Mutex<Vec<f64>>,
    }

    impl ScriptedSampler {
        fn new(ratios: &[f64]) -> Self {
            let mut ratios = ratios.to_vec();
            ratios.reverse();
            Self {
                ratios: Mutex::new(ratios),
            }
        }
    }

    impl MemorySampler for ScriptedSampler {
        fn sample(&self) -> Option<MemorySample> {
            let ratio = self.ratios.lock().unwrap().pop()?;
            Some(MemorySample {
                used: (ratio * 1000.0) as u64,
                total: 1000,
            })
        }
    }

    #[derive(Default)]
    struct CountingFlow {
        paused: AtomicBool,
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl FlowControl for CountingFlow {
        fn pause_reads(&self) {
            self.paused.store(true, Ordering::SeqCst);
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_reads(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
    }

    fn every(n: u64) -> IngestConfig {
        IngestConfig {
            sample_every: n,
            ..Default::default()
        }
    }

    #[test]
    fn pauses_once_then_resumes_once() {
        let sampler = ScriptedSampler::new(&[0.5, 0.85, 0.9, 0.7, 0.6, 0.5, 0.3]);
        let flow = CountingFlow::default();
        let mut bp = Backpressure::new(&every(1));

        let actions: Vec<_> = (0..7).map(|_| bp.on_tick(&sampler, &flow)).collect();
        assert_eq!(actions, vec![
            None,
            Some(FlowAction::Paused),
            None,
            None,
            None,
            Some(FlowAction::Resumed),
            None,
        ]);
        assert_eq!(flow.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(flow.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn samples_only_every_k_ticks() {
        let sampler = ScriptedSampler::new(&[0.95]);
        let flow = CountingFlow::default();
        let mut bp = Backpressure::new(&every(50));
        for _ in 0..49 {
            assert_eq!(bp.on_tick(&sampler, &flow), None);
        }
        assert_eq!(bp.on_tick(&sampler, &flow), Some(FlowAction::Paused));
    }

    #[tokio::test]
    async fn recheck_resumes_without_ticks() {
        let sampler: Arc<dyn MemorySampler> = Arc::new(ScriptedSampler::new(&[0.9, 0.7, 0.2]));
        let flow = CountingFlow::default();
        let store = EventStore::new(crate::connect_in_memory().await.unwrap());
        let mut ingest = SessionIngest::new("s1", store, sampler, &every(50));

        assert_eq!(ingest.recheck(&flow), Some(FlowAction::Paused));
        assert_eq!(ingest.recheck(&flow), None);
        assert_eq!(ingest.recheck(&flow), Some(FlowAction::Resumed));
        assert_eq!(flow.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(flow.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(ingest.tick(&flow), None);
    }

    #[test]
    fn inside_hysteresis_band_nothing_changes() {
        let sampler = ScriptedSampler::new(&[0.7, 0.79, 0.57]);
        let flow = CountingFlow::default();
        let mut bp = Backpressure::new(&every(1));
        for _ in 0..3 {
            assert_eq!(bp.on_tick(&sampler, &flow), None);
        }
        assert!(!flow.is_paused());
    }

    fn message(jid: &str, id: &str, ts: i64, from_me: bool) -> Message {
        Message {
            key: MessageKey {
                remote_jid: jid.into(),
                id: id.into(),
                from_me,
            },
            message_timestamp: Some(ts),
            fields: Map::new(),
        }
    }

    async fn ingest() -> (SessionIngest, EventStore) {
        let store = EventStore::new(crate::connect_in_memory().await.unwrap());
        let sampler: Arc<dyn MemorySampler> = Arc::new(ScriptedSampler::new(&[]));
        let mut ingest = SessionIngest::new("s1", store.clone(), sampler, &every(1));
        assert!(ingest.attach());
        (ingest, store)
    }

    #[tokio::test]
    async fn synthesizes_missing_chat_exactly_once() {
        let (mut ingest, store) = ingest().await;

        let batch = EventBatch {
            messages_upsert: vec![
                message("new@s", "1", 10, false),
                message("new@s", "2", 20, true),
            ],
            ..Default::default()
        };
        let outcome = ingest.process(&batch).await.unwrap();
        assert_eq!(outcome.rows_written, 3);

        let chats = store.list_chats("s1").await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id, "new@s");
        assert_eq!(chats[0].data["unreadCount"], 1);
        assert_eq!(chats[0].data["conversationTimestamp"], 20);

        // The chat now exists: no second synthesis.
        let outcome = ingest.process(&batch).await.unwrap();
        assert!(outcome.orphan_chats.is_empty());
        assert_eq!(outcome.rows_written, 2);
    }

    #[tokio::test]
    async fn detached_pipeline_drops_store_events() {
        let (mut ingest, store) = ingest().await;
        assert!(ingest.detach());
        assert!(!ingest.detach());

        let batch = EventBatch {
            messages_upsert: vec![message("a@s", "1", 1, false)],
            ..Default::default()
        };
        ingest.process(&batch).await.unwrap();
        assert_eq!(store.count_messages("s1").await.unwrap(), 0);

        assert!(ingest.attach());
        assert!(!ingest.attach());
        ingest.process(&batch).await.unwrap();
        assert_eq!(store.count_messages("s1").await.unwrap(), 1);
    }
}
