use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener<T> = Box<dyn Fn(&T) + Send>;

/// Identifies a registered listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A value holder with change listeners.
///
/// The single-writer role for each observable belongs to the merge pipeline
/// feeding it; every other component reads. `set`/`update` notify listeners
/// synchronously with the new value, then fan the value out to any `watch`
/// streams. Listeners must not re-register on the same observable from
/// inside the notification.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: RwLock<T>,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    watchers: Mutex<Vec<UnboundedSender<T>>>,
    next_id: AtomicU64,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(initial),
                listeners: Mutex::new(Vec::new()),
                watchers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Reads the current value without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replaces the value and notifies listeners.
    pub fn set(&self, next: T) {
        *self.inner.value.write() = next.clone();
        self.notify(&next);
    }

    /// Computes the next value from the current one, publishes it, and
    /// notifies listeners synchronously.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = {
            let mut guard = self.inner.value.write();
            let next = f(&guard);
            *guard = next.clone();
            next
        };
        self.notify(&next);
    }

    /// Registers a change listener, invoked synchronously on every publish.
    pub fn observe(&self, f: impl Fn(&T) + Send + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Box::new(f)));
        id
    }

    /// Removes a listener. Unknown ids are ignored.
    pub fn forget(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Returns an async stream of values: the current value first, then
    /// every subsequent publish. Dropped receivers are pruned lazily.
    pub fn watch(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(self.get());
        self.inner.watchers.lock().push(tx);
        rx
    }

    fn notify(&self, next: &T) {
        for (_, listener) in self.inner.listeners.lock().iter() {
            listener(next);
        }
        self.inner
            .watchers
            .lock()
            .retain(|tx| tx.unbounded_send(next.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn listeners_fire_synchronously() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observable.observe(move |v| sink.lock().push(*v));

        observable.set(1);
        observable.update(|v| v + 1);
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(observable.get(), 2);
    }

    #[test]
    fn forgotten_listeners_stop_firing() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        let id = observable.observe(move |_| *sink.lock() += 1);

        observable.set(1);
        observable.forget(id);
        observable.set(2);
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn watch_yields_current_then_updates() {
        let observable = Observable::new(10u32);
        let mut stream = observable.watch();

        assert_eq!(stream.next().await, Some(10));
        observable.set(11);
        assert_eq!(stream.next().await, Some(11));
    }

    #[tokio::test]
    async fn dropped_watchers_are_pruned() {
        let observable = Observable::new(0u32);
        drop(observable.watch());
        observable.set(1);
        let mut live = observable.watch();
        assert_eq!(live.next().await, Some(1));
    }
}
