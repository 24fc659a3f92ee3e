//! Per-event listener table shared by the bus, channels and tunnels.

use crate::error::{BusError, BusResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Handle returned by every registration; pass it to `off` to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One registration. Dispatch works on clones of these.
pub(crate) struct Slot<F: ?Sized> {
    id: ListenerId,
    once: bool,
    pub(crate) callback: Arc<F>,
}

impl<F: ?Sized> Clone for Slot<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: self.callback.clone(),
        }
    }
}

/// Event name -> listeners in registration order.
pub(crate) struct ListenerSet<F: ?Sized> {
    next_id: u64,
    events: HashMap<String, Vec<Slot<F>>>,
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            next_id: 0,
            events: HashMap::new(),
        }
    }
}

impl<F: ?Sized> ListenerSet<F> {
    pub(crate) fn add(&mut self, event: &str, callback: Arc<F>, once: bool) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.events
            .entry(event.to_string())
            .or_default()
            .push(Slot { id, once, callback });
        id
    }

    pub(crate) fn remove(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(slots) = self.events.get_mut(event) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            self.events.remove(event);
        }
        removed
    }

    pub(crate) fn clear(&mut self, event: &str) {
        self.events.remove(event);
    }

    pub(crate) fn clear_all(&mut self) {
        self.events.clear();
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events.get(event).map_or(0, Vec::len)
    }

    /// Slots to run for one emission. `once` slots are detached here, so a
    /// re-entrant emission can never run them a second time.
    pub(crate) fn take_for_dispatch(&mut self, event: &str) -> Vec<Slot<F>> {
        let Some(slots) = self.events.get_mut(event) else {
            return Vec::new();
        };
        let snapshot = slots.clone();
        slots.retain(|slot| !slot.once);
        if slots.is_empty() {
            self.events.remove(event);
        }
        snapshot
    }

    /// Whether a slot from [`ListenerSet::take_for_dispatch`] should still run.
    /// `once` slots were already detached by this dispatch and always run.
    pub(crate) fn still_registered(&self, event: &str, slot: &Slot<F>) -> bool {
        slot.once
            || self
                .events
                .get(event)
                .is_some_and(|slots| slots.iter().any(|s| s.id == slot.id))
    }
}

/// Listener tables are only touched from synchronous callbacks; a panic in
/// one of them must not wedge every later dispatch.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves with the payload of the next matching event.
///
/// The listener behind it is registered when the future is created, not when
/// it is first polled. It never resolves if the event never arrives.
#[derive(Debug)]
pub struct OnceFuture {
    rx: oneshot::Receiver<Value>,
}

impl OnceFuture {
    /// Future plus the slot a `once` listener fills.
    pub(crate) fn pair() -> (Self, OnceSlot) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, OnceSlot(Mutex::new(Some(tx))))
    }
}

impl Future for OnceFuture {
    type Output = BusResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| BusError::Closed))
    }
}

pub(crate) struct OnceSlot(Mutex<Option<oneshot::Sender<Value>>>);

impl OnceSlot {
    pub(crate) fn fill(&self, payload: &Value) {
        if let Some(tx) = lock(&self.0).take() {
            let _ = tx.send(payload.clone());
        }
    }
}

/// Collapse the responses of one dispatch into the value the caller sees:
/// nothing -> `null`, one -> that value, several -> array in listener order.
pub fn aggregate(mut responses: Vec<Value>) -> Value {
    match responses.len() {
        0 => Value::Null,
        1 => responses.pop().unwrap_or(Value::Null),
        _ => Value::Array(responses),
    }
}
