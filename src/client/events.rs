#![forbid(unsafe_code)]

// Typed event dispatch for the call session.
//
// One Listeners<E> per event kind. Every registration returns a Subscription
// handle; dropping it (or calling unsubscribe) removes the listener, so
// listener lists cannot grow without bound across repeated join/leave cycles.

use crate::engine::ParticipantId;
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Box<dyn Fn(&E) + Send>;

struct ListenerList<E> {
    next_id: u64,
    entries: Vec<(u64, Callback<E>)>,
}

/// Listener registry for one event kind.
pub struct Listeners<E> {
    inner: Arc<Mutex<ListenerList<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerList {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }
}

// The unsubscribe closure type-erases its Weak reference to the list, so E
// must not borrow anything shorter-lived
impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. The listener stays active until the returned
    /// Subscription is dropped or unsubscribed.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + 'static) -> Subscription {
        let id = {
            let mut list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = list.next_id;
            list.next_id += 1;
            list.entries.push((id, Box::new(callback)));
            id
        };

        let weak: Weak<Mutex<ListenerList<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut list = inner.lock().unwrap_or_else(|e| e.into_inner());
                    list.entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Fires the event synchronously to every registered listener.
    pub fn emit(&self, event: &E) {
        let list = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (_, callback) in &list.entries {
            callback(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

/// Removes its listener when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Whose screen share an event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenShareOrigin {
    /// The local participant's own share. Emitted optimistically, without
    /// waiting for the server round trip.
    Local,
    Remote(ParticipantId),
}

/// Event surface exposed to the UI layer.
#[derive(Default)]
pub struct EventHub {
    pub participant_joined: Listeners<crate::client::participant::RemoteParticipant>,
    pub participant_updated: Listeners<crate::client::participant::RemoteParticipant>,
    pub participant_left: Listeners<ParticipantId>,
    pub screen_share_started: Listeners<ScreenShareOrigin>,
    pub screen_share_stopped: Listeners<ScreenShareOrigin>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_every_listener() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let a = hits.clone();
        let _sub_a = listeners.subscribe(move |v| {
            a.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let b = hits.clone();
        let _sub_b = listeners.subscribe(move |v| {
            b.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn dropping_subscription_removes_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let a = hits.clone();
        let sub = listeners.subscribe(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.listener_count(), 1);

        drop(sub);
        assert_eq!(listeners.listener_count(), 0);
        listeners.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn explicit_unsubscribe_removes_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let sub = listeners.subscribe(|_| {});
        let other = listeners.subscribe(|_| {});
        assert_eq!(listeners.listener_count(), 2);

        sub.unsubscribe();
        assert_eq!(listeners.listener_count(), 1);
        drop(other);
        assert_eq!(listeners.listener_count(), 0);
    }
}
