// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session event router: sequences, persists, and fans out.
//!
//! One router task per running session owns the subscriber set. Adapter
//! emissions, subscribe, and unsubscribe all arrive as messages on a single
//! queue, so sequence assignment and delivery ordering agree by
//! construction. Each subscriber has a bounded buffer; a subscriber that
//! cannot keep up is dropped with a `backpressure` reason and recovers by
//! re-attaching from its last delivered seq.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{epoch_ms, Emission, EventRecord};
use crate::store::EventStore;

/// Messages accepted by a router task.
enum RouterMsg {
    Emit(Emission),
    Subscribe(SubscriberSlot),
    Unsubscribe(u64),
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A sequenced, persisted event.
    Event(Arc<EventRecord>),
    /// Out-of-band fault notice; not persisted, no seq.
    Fault(String),
}

/// Why a subscription's channel closed.
pub const DROP_BACKPRESSURE: &str = "backpressure";
pub const DROP_CLOSED: &str = "closed";

/// Router-side half of one subscription.
struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    drop_reason: Arc<OnceLock<&'static str>>,
}

/// Subscriber-side half: receive deliveries until the channel closes, then
/// consult [`Subscription::drop_reason`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Delivery>,
    drop_reason: Arc<OnceLock<&'static str>>,
}

impl Subscription {
    /// Why the router closed this subscription, once it has.
    pub fn drop_reason(&self) -> Option<&'static str> {
        self.drop_reason.get().copied()
    }
}

/// How a router task ended; consumed by the registry reaper.
#[derive(Debug)]
pub enum RouterOutcome {
    /// The session's terminal event was sequenced and delivered.
    Terminal(Arc<EventRecord>),
    /// An append failed; the session is faulted.
    StoreFault(String),
}

/// Terminal notice sent to the registry when a router ends.
#[derive(Debug)]
pub struct RouterExit {
    pub session_id: String,
    pub outcome: RouterOutcome,
}

/// Cloneable handle to a running router task.
#[derive(Clone)]
pub struct RouterHandle {
    session_id: String,
    tx: mpsc::Sender<RouterMsg>,
    next_sub_id: Arc<AtomicU64>,
}

impl RouterHandle {
    /// Ingress handle for the adapter.
    pub fn sink(&self) -> EventSink {
        EventSink { tx: self.tx.clone() }
    }

    /// Bind a new subscriber with the given buffer bound.
    ///
    /// Returns `None` if the router has already closed (terminal event or
    /// store fault); callers fall back to replay-only attachment.
    pub async fn subscribe(&self, buffer: usize) -> Option<Subscription> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let drop_reason = Arc::new(OnceLock::new());
        let slot = SubscriberSlot { id, tx, drop_reason: Arc::clone(&drop_reason) };
        if self.tx.send(RouterMsg::Subscribe(slot)).await.is_err() {
            return None;
        }
        Some(Subscription { id, rx, drop_reason })
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(RouterMsg::Unsubscribe(id)).await;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// The emit half handed to adapters at start.
///
/// Adapters never see the store or the subscribers; every observable effect
/// goes through [`EventSink::emit`].
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RouterMsg>,
}

impl EventSink {
    /// Emit one event. A send into a closed router is silently dropped:
    /// after the terminal event nothing further is accepted.
    pub async fn emit(&self, emission: Emission) {
        if self.tx.send(RouterMsg::Emit(emission)).await.is_err() {
            debug!("emit after router close dropped");
        }
    }
}

/// Spawn the router task for one session.
pub fn spawn(
    session_id: String,
    store: Arc<EventStore>,
    exit_tx: mpsc::Sender<RouterExit>,
) -> RouterHandle {
    let (tx, rx) = mpsc::channel(256);
    let handle = RouterHandle {
        session_id: session_id.clone(),
        tx,
        next_sub_id: Arc::new(AtomicU64::new(1)),
    };
    tokio::spawn(run(session_id, store, rx, exit_tx));
    handle
}

async fn run(
    session_id: String,
    store: Arc<EventStore>,
    mut rx: mpsc::Receiver<RouterMsg>,
    exit_tx: mpsc::Sender<RouterExit>,
) {
    let mut subs: Vec<SubscriberSlot> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            RouterMsg::Subscribe(slot) => {
                subs.push(slot);
            }
            RouterMsg::Unsubscribe(id) => {
                subs.retain(|s| s.id != id);
            }
            RouterMsg::Emit(emission) => {
                let ts = epoch_ms();
                let seq = match store.append_event(
                    &session_id,
                    emission.channel,
                    emission.event_type,
                    &emission.payload,
                    ts,
                ) {
                    Ok(seq) => seq,
                    Err(fault) => {
                        // The event was not persisted, so it must not be
                        // broadcast. Subscribers get an out-of-band notice
                        // and the session is faulted.
                        warn!(session = %session_id, %fault, "append failed, faulting session");
                        for slot in &subs {
                            let _ = slot.tx.try_send(Delivery::Fault(fault.message.clone()));
                        }
                        let _ = exit_tx
                            .send(RouterExit {
                                session_id,
                                outcome: RouterOutcome::StoreFault(fault.message),
                            })
                            .await;
                        return;
                    }
                };

                let record = Arc::new(EventRecord {
                    seq,
                    channel: emission.channel.to_owned(),
                    event_type: emission.event_type.to_owned(),
                    payload: emission.payload,
                    ts,
                });

                deliver(&mut subs, &record);

                if record.is_terminal() {
                    debug!(session = %session_id, seq, "terminal event, closing router");
                    let _ = exit_tx
                        .send(RouterExit {
                            session_id,
                            outcome: RouterOutcome::Terminal(record),
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// FIFO delivery to every subscriber. A full buffer drops that subscription;
/// the event log is the recovery mechanism, so no data is lost — only the
/// subscription.
fn deliver(subs: &mut Vec<SubscriberSlot>, record: &Arc<EventRecord>) {
    subs.retain(|slot| match slot.tx.try_send(Delivery::Event(Arc::clone(record))) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(sub = slot.id, "subscriber over buffer, dropping with backpressure");
            let _ = slot.drop_reason.set(DROP_BACKPRESSURE);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            let _ = slot.drop_reason.set(DROP_CLOSED);
            false
        }
    });
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
