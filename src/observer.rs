//! Per-component listener sets.
//!
//! Each component owns one `Observers<E>` for its event type. Registration
//! returns a `Subscription`; listeners stay attached until it is cancelled or
//! the owning component is dropped.

use std::sync::{Arc, Mutex, Weak};

use crate::util::lock;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Table<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

pub struct Observers<E> {
    table: Arc<Mutex<Table<E>>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut guard = lock(&self.table);
            let id = guard.next_id;
            guard.next_id += 1;
            guard.listeners.push((id, Arc::new(listener)));
            id
        };
        let weak: Weak<Mutex<Table<E>>> = Arc::downgrade(&self.table);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    lock(&table).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Listeners run outside the table lock so they may subscribe or cancel.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = lock(&self.table)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.table).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
