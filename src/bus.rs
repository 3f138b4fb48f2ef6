//! Typed publish/subscribe dispatch of received messages.
//!
//! Every decoded message is posted to the [`MessageBus`] of its connection,
//! which hands it to each listener subscribed to the message's concrete
//! type. Listeners run synchronously on the thread that posted the message.

use crate::message::Message;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, trace};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Opaque key grouping subscriptions for bulk unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(u64);

impl Owner {
    /// Creates a key that is distinct from every other key in the process.
    pub fn new() -> Self {
        Owner(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies a single subscription, returned by the `listen_*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn Fn(&dyn Message) + Send + Sync>;

struct Subscription {
    id: ListenerId,
    once: bool,
    owner: Option<Owner>,
    // Cleared on unregistration and when a once-subscription fires.
    active: AtomicBool,
    callback: Callback,
}

/// Typed message bus with "always" and "once" subscriptions.
///
/// Thread-safe: listeners can be added or removed from any thread, also from
/// inside a listener while a message is being dispatched.
#[derive(Default)]
pub struct MessageBus {
    listeners: Mutex<HashMap<TypeId, Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.lock();
        let count: usize = listeners.values().map(Vec::len).sum();
        f.debug_struct("MessageBus")
            .field("listeners", &count)
            .finish()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `callback` to every posted `T`.
    pub fn listen_always<T, F>(&self, owner: Option<Owner>, callback: F) -> ListenerId
    where
        T: Message,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe::<T, F>(false, owner, callback)
    }

    /// Subscribes `callback` to the next posted `T` only.
    pub fn listen_once<T, F>(&self, owner: Option<Owner>, callback: F) -> ListenerId
    where
        T: Message,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe::<T, F>(true, owner, callback)
    }

    /// Removes the subscription `id` for `T`. Unknown ids are ignored.
    pub fn unregister<T: Message>(&self, id: ListenerId) {
        self.remove_where(TypeId::of::<T>(), |sub| sub.id == id);
    }

    /// Removes every subscription for `T` registered with `owner`.
    ///
    /// Does nothing for `None`; subscriptions without an owner are only
    /// removed through [`Self::unregister`].
    pub fn unregister_owner<T: Message>(&self, owner: Option<Owner>) {
        let Some(owner) = owner else {
            return;
        };
        self.remove_where(TypeId::of::<T>(), |sub| sub.owner == Some(owner));
    }

    /// Removes every subscription of `owner`, for all message types.
    pub fn unregister_all_for_owner(&self, owner: Owner) {
        let mut listeners = self.lock();
        for subs in listeners.values_mut() {
            subs.retain(|sub| {
                let keep = sub.owner != Some(owner);
                if !keep {
                    sub.active.store(false, Ordering::Release);
                }
                keep
            });
        }
        listeners.retain(|_, subs| !subs.is_empty());
    }

    /// Number of subscriptions for `T`.
    pub fn listener_count<T: Message>(&self) -> usize {
        self.lock()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }

    /// Dispatches `message` to the subscriptions of its concrete type in
    /// registration order.
    ///
    /// A panicking listener is logged and does not prevent delivery to the
    /// remaining listeners.
    pub fn post(&self, message: &dyn Message) {
        let type_id = Any::type_id(message.as_any());

        // Snapshot, so listeners can (un)subscribe while we iterate
        let snapshot: Vec<Arc<Subscription>> = match self.lock().get(&type_id) {
            Some(subs) => subs.clone(),
            None => {
                trace!(msg = message.message_name(), "No listeners for message");
                return;
            }
        };

        let mut spent = Vec::new();
        for sub in snapshot {
            let runnable = if sub.once {
                sub.active.swap(false, Ordering::AcqRel)
            } else {
                sub.active.load(Ordering::Acquire)
            };
            if !runnable {
                continue;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(message)));
            if let Err(payload) = result {
                error!(
                    msg = message.message_name(),
                    listener = sub.id.0,
                    panic = panic_message(payload.as_ref()),
                    "Message listener panicked"
                );
            }

            if sub.once {
                spent.push(sub.id);
            }
        }

        if !spent.is_empty() {
            self.remove_where(type_id, |sub| spent.contains(&sub.id));
        }
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl MessageBus {
    fn subscribe<T, F>(&self, once: bool, owner: Option<Owner>, callback: F) -> ListenerId
    where
        T: Message,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Box::new(move |msg: &dyn Message| {
            if let Some(concrete) = msg.downcast_ref::<T>() {
                callback(concrete)
            }
        });
        trace!(listener = id.0, once, msg = type_name::<T>(), "Adding listener");
        self.lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Arc::new(Subscription {
                id,
                once,
                owner,
                active: AtomicBool::new(true),
                callback,
            }));
        id
    }

    fn remove_where<P>(&self, type_id: TypeId, predicate: P)
    where
        P: Fn(&Subscription) -> bool,
    {
        let mut listeners = self.lock();
        if let Some(subs) = listeners.get_mut(&type_id) {
            subs.retain(|sub| {
                let remove = predicate(sub);
                if remove {
                    sub.active.store(false, Ordering::Release);
                }
                !remove
            });
            if subs.is_empty() {
                listeners.remove(&type_id);
            }
        }
    }

    // Listeners never run while the lock is held, so a poisoned lock only
    // means a panic inside the table bookkeeping itself.
    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Arc<Subscription>>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
