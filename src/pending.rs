//! Correlates broker responses with the callers that issued the commands.
//!
//! Every outgoing command gets a fresh `requestId` and a single-use waiter.
//! Responses that echo the id wake exactly that waiter. Brokers that do not
//! echo ids answer in order, so an id-less response wakes the oldest waiter
//! of its kind. With one request per kind in flight this is the same
//! behavior as a single shared result slot; with overlap it stays FIFO
//! instead of overwriting. Waiters wake on arrival; nothing polls.
//!
//! A caller that gave up (timeout or drop) leaves a dead waiter behind. Once
//! the broker has echoed an id, dead waiters are removed right away. Before
//! that, a dead waiter stays only until a newer request of its kind is
//! issued, so a late answer with nobody else waiting is absorbed, and a lost
//! answer can never wedge the queue.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    error::{BridgeError, BridgeResult},
    protocol::{BrokerCommand, BrokerMessage, CommandKind, OutboundFrame},
};

/// Where issued commands are written. Sending never fails from the caller's
/// point of view; a dead channel surfaces through [`PendingResults::close`].
pub trait CommandSink {
    fn send(&self, frame: OutboundFrame);
}

struct Waiter {
    request_id: String,
    tx: oneshot::Sender<BrokerMessage>,
}

#[derive(Default)]
struct Slots {
    waiting: HashMap<CommandKind, VecDeque<Waiter>>,
    closed: Option<String>,
    /// Set once any response carried a `requestId`.
    echoes_ids: bool,
}

impl Waiter {
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// Nobody was waiting, or the waiter had already given up.
    Discarded,
}

#[derive(Clone, Default)]
pub struct PendingResults {
    inner: Arc<Mutex<Slots>>,
}

impl PendingResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `command` and waits for the matching response.
    ///
    /// `timeout = None` waits as long as the channel stays open.
    pub async fn issue<S>(
        &self,
        sink: &S,
        command: BrokerCommand,
        timeout: Option<Duration>,
    ) -> BridgeResult<BrokerMessage>
    where
        S: CommandSink + ?Sized,
    {
        let kind = command.kind();
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut slots = self.inner.lock();
            if let Some(reason) = &slots.closed {
                return Err(BridgeError::Channel(reason.clone()));
            }
            let queue = slots.waiting.entry(kind).or_default();
            queue.retain(Waiter::is_live);
            queue.push_back(Waiter {
                request_id: request_id.clone(),
                tx,
            });
        }

        tracing::debug!(
            target = "sso_bridge::pending",
            command = %kind,
            request_id = %request_id,
            "issuing broker command"
        );
        sink.send(OutboundFrame {
            command,
            request_id: request_id.clone(),
        });

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.abandon(kind, &request_id);
                    return Err(BridgeError::Timeout {
                        kind,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        received.map_err(|_| {
            let reason = self
                .inner
                .lock()
                .closed
                .clone()
                .unwrap_or_else(|| "waiter dropped".to_string());
            BridgeError::Channel(reason)
        })
    }

    /// Routes a response to its waiter. Broker state changes are not
    /// responses and are always discarded here.
    pub fn resolve(&self, request_id: Option<&str>, message: BrokerMessage) -> Resolution {
        let Some(kind) = message.kind() else {
            return Resolution::Discarded;
        };

        let waiter = {
            let mut slots = self.inner.lock();
            if request_id.is_some() {
                slots.echoes_ids = true;
            }
            let Some(queue) = slots.waiting.get_mut(&kind) else {
                return self.discard(kind, request_id, "no waiter");
            };
            match request_id {
                Some(id) => queue
                    .iter()
                    .position(|waiter| waiter.request_id == id)
                    .and_then(|index| queue.remove(index)),
                None => {
                    // Dead waiters ahead of a live one lost their answer.
                    if let Some(live) = queue.iter().position(Waiter::is_live) {
                        queue.drain(..live);
                    }
                    queue.pop_front()
                }
            }
        };

        let Some(waiter) = waiter else {
            return self.discard(kind, request_id, "no matching waiter");
        };
        match waiter.tx.send(message) {
            Ok(()) => Resolution::Delivered,
            Err(_) => self.discard(kind, Some(&waiter.request_id), "waiter gave up"),
        }
    }

    /// Fails every outstanding and future `issue` with a channel error.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slots = self.inner.lock();
        let dropped: usize = slots.waiting.values().map(VecDeque::len).sum();
        slots.waiting.clear();
        slots.closed = Some(reason.clone());
        if dropped > 0 {
            tracing::warn!(
                target = "sso_bridge::pending",
                dropped,
                reason = %reason,
                "failing outstanding broker requests"
            );
        }
    }

    /// Waiters of `kind` still expecting an answer.
    pub fn outstanding(&self, kind: CommandKind) -> usize {
        self.inner
            .lock()
            .waiting
            .get(&kind)
            .map_or(0, |queue| queue.iter().filter(|w| w.is_live()).count())
    }

    fn abandon(&self, kind: CommandKind, request_id: &str) {
        let mut slots = self.inner.lock();
        if !slots.echoes_ids {
            return;
        }
        if let Some(queue) = slots.waiting.get_mut(&kind) {
            queue.retain(|waiter| waiter.request_id != request_id);
        }
    }

    fn discard(&self, kind: CommandKind, request_id: Option<&str>, why: &str) -> Resolution {
        tracing::warn!(
            target = "sso_bridge::pending",
            command = %kind,
            request_id = request_id.unwrap_or("-"),
            "discarding broker response: {why}"
        );
        Resolution::Discarded
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;

    use super::{CommandSink, PendingResults, Resolution};
    use crate::{
        error::BridgeError,
        protocol::{Account, BrokerCommand, BrokerMessage, CommandKind, OutboundFrame, PrtCookie},
    };

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<OutboundFrame>>,
    }

    impl CommandSink for RecordingSink {
        fn send(&self, frame: OutboundFrame) {
            self.frames.lock().push(frame);
        }
    }

    impl RecordingSink {
        async fn wait_for(&self, count: usize) -> Vec<String> {
            loop {
                {
                    let frames = self.frames.lock();
                    if frames.len() >= count {
                        return frames.iter().map(|f| f.request_id.clone()).collect();
                    }
                }
                tokio::task::yield_now().await;
            }
        }
    }

    fn prt_command(url: &str) -> BrokerCommand {
        BrokerCommand::AcquirePrtSsoCookie {
            account: Account::new("alice@contoso.com"),
            sso_url: url.to_string(),
        }
    }

    fn cookie(content: &str) -> BrokerMessage {
        BrokerMessage::PrtCookie(Ok(PrtCookie {
            cookie_name: "x-ms-RefreshTokenCredential".into(),
            cookie_content: content.into(),
        }))
    }

    #[tokio::test]
    async fn id_less_response_wakes_the_single_waiter() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move {
                pending
                    .issue(sink.as_ref(), BrokerCommand::GetAccounts, None)
                    .await
            })
        };
        sink.wait_for(1).await;
        assert_eq!(pending.outstanding(CommandKind::GetAccounts), 1);

        let delivered = pending.resolve(
            None,
            BrokerMessage::Accounts(Ok(vec![Account::new("alice@contoso.com")])),
        );
        assert_eq!(delivered, Resolution::Delivered);

        let message = task.await.unwrap().unwrap();
        assert!(matches!(message, BrokerMessage::Accounts(Ok(ref a)) if a.len() == 1));
        assert_eq!(pending.outstanding(CommandKind::GetAccounts), 0);
    }

    #[tokio::test]
    async fn echoed_ids_route_out_of_order_responses() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let first = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("a"), None).await })
        };
        sink.wait_for(1).await;
        let second = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("b"), None).await })
        };
        let ids = sink.wait_for(2).await;

        pending.resolve(Some(&ids[1]), cookie("for-b"));
        pending.resolve(Some(&ids[0]), cookie("for-a"));

        assert_eq!(first.await.unwrap().unwrap(), cookie("for-a"));
        assert_eq!(second.await.unwrap().unwrap(), cookie("for-b"));
    }

    #[tokio::test]
    async fn id_less_responses_are_fifo_per_kind() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let first = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("a"), None).await })
        };
        sink.wait_for(1).await;
        let second = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("b"), None).await })
        };
        sink.wait_for(2).await;

        pending.resolve(None, cookie("one"));
        pending.resolve(None, cookie("two"));

        assert_eq!(first.await.unwrap().unwrap(), cookie("one"));
        assert_eq!(second.await.unwrap().unwrap(), cookie("two"));
    }

    #[test]
    fn unsolicited_response_is_discarded() {
        let pending = PendingResults::new();
        assert_eq!(pending.resolve(None, cookie("stale")), Resolution::Discarded);
        assert_eq!(
            pending.resolve(Some("req_unknown"), cookie("stale")),
            Resolution::Discarded
        );
    }

    #[tokio::test]
    async fn close_fails_outstanding_and_future_requests() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let waiting = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("a"), None).await })
        };
        sink.wait_for(1).await;
        pending.close("native application connection closed");

        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_channel());
        assert!(err.to_string().contains("native application connection closed"));

        let err = pending
            .issue(sink.as_ref(), BrokerCommand::GetAccounts, None)
            .await
            .unwrap_err();
        assert!(err.is_channel());
        assert_eq!(sink.frames.lock().len(), 1, "no command written after close");
    }

    #[tokio::test]
    async fn timeout_keeps_queue_aligned() {
        let pending = PendingResults::new();
        let sink = RecordingSink::default();

        let err = pending
            .issue(&sink, prt_command("a"), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { kind: CommandKind::AcquirePrtSsoCookie, .. }));

        // The late answer belongs to the timed-out request and must not leak.
        assert_eq!(pending.resolve(None, cookie("late")), Resolution::Discarded);
        assert_eq!(pending.outstanding(CommandKind::AcquirePrtSsoCookie), 0);
    }

    #[tokio::test]
    async fn lost_id_less_answer_does_not_wedge_later_requests() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let err = pending
            .issue(sink.as_ref(), prt_command("lost"), Some(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));

        for round in 0..5 {
            let task = {
                let (pending, sink) = (pending.clone(), sink.clone());
                tokio::spawn(async move {
                    pending
                        .issue(sink.as_ref(), prt_command("next"), Some(Duration::from_secs(5)))
                        .await
                })
            };
            sink.wait_for(round + 2).await;

            let content = format!("cookie-{round}");
            assert_eq!(pending.resolve(None, cookie(&content)), Resolution::Delivered);
            assert_eq!(task.await.unwrap().unwrap(), cookie(&content));
        }
        assert_eq!(pending.outstanding(CommandKind::AcquirePrtSsoCookie), 0);
    }

    #[tokio::test]
    async fn id_less_answer_skips_waiters_that_gave_up() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let impatient = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move {
                pending
                    .issue(sink.as_ref(), prt_command("a"), Some(Duration::from_millis(5)))
                    .await
            })
        };
        sink.wait_for(1).await;
        let patient = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("b"), None).await })
        };
        sink.wait_for(2).await;

        assert!(matches!(
            impatient.await.unwrap(),
            Err(BridgeError::Timeout { .. })
        ));
        assert_eq!(pending.outstanding(CommandKind::AcquirePrtSsoCookie), 1);

        assert_eq!(pending.resolve(None, cookie("for-b")), Resolution::Delivered);
        assert_eq!(patient.await.unwrap().unwrap(), cookie("for-b"));
    }

    #[tokio::test]
    async fn timed_out_waiters_are_dropped_once_broker_echoes_ids() {
        let pending = PendingResults::new();
        let sink = Arc::new(RecordingSink::default());

        let first = {
            let (pending, sink) = (pending.clone(), sink.clone());
            tokio::spawn(async move { pending.issue(sink.as_ref(), prt_command("a"), None).await })
        };
        let ids = sink.wait_for(1).await;
        pending.resolve(Some(&ids[0]), cookie("a"));
        first.await.unwrap().unwrap();

        for _ in 0..100 {
            let err = pending
                .issue(sink.as_ref(), prt_command("slow"), Some(Duration::from_millis(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { .. }));
        }

        assert_eq!(pending.outstanding(CommandKind::AcquirePrtSsoCookie), 0);
        let queued = pending
            .inner
            .lock()
            .waiting
            .get(&CommandKind::AcquirePrtSsoCookie)
            .map_or(0, |queue| queue.len());
        assert_eq!(queued, 0);

        let ids = sink.wait_for(101).await;
        assert_eq!(
            pending.resolve(Some(&ids[100]), cookie("late")),
            Resolution::Discarded
        );
    }

    #[tokio::test]
    async fn repeated_id_less_timeouts_stay_bounded() {
        let pending = PendingResults::new();
        let sink = RecordingSink::default();

        for _ in 0..100 {
            let err = pending
                .issue(&sink, BrokerCommand::GetAccounts, Some(Duration::from_millis(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { .. }));
        }

        assert_eq!(pending.outstanding(CommandKind::GetAccounts), 0);
        let queued = pending
            .inner
            .lock()
            .waiting
            .get(&CommandKind::GetAccounts)
            .map_or(0, |queue| queue.len());
        assert!(queued <= 1, "dead waiters piled up: {queued}");
    }
}
