/**
 * EVENT BUS - Diffusion in-process vers N abonnés
 *
 * RÔLE :
 * Les workers de nœud publient, chaque session WebSocket s'abonne. Chaque
 * abonné possède sa propre file bornée.
 *
 * FONCTIONNEMENT :
 * - `publish` ne bloque jamais : file pleine => l'élément le plus ancien est
 *   jeté (monitoring best-effort, pas exactly-once)
 * - ordre FIFO garanti par éditeur : un worker publie depuis une seule tâche
 * - `Subscription` = jeton de capacité ; le drop désabonne immédiatement
 * - publier vers un abonné déjà fermé est un no-op
 */

use crate::state::{new_state, Shared};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

pub type SubscriptionId = u64;

struct SubscriberQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> SubscriberQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Renvoie false si la file était pleine (l'élément le plus ancien a sauté)
    fn push(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        let mut overflowed = false;
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                overflowed = true;
            }
            items.push_back(item);
        }
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        !overflowed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusInner<T> {
    subscribers: Shared<HashMap<SubscriptionId, Arc<SubscriberQueue<T>>>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BusInner<T> {
    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(queue) = self.subscribers.lock().remove(&id) {
            queue.close();
        }
    }
}

pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send> EventBus<T> {
    /// `capacity` = taille de la file de chaque abonné (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: new_state(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.inner.capacity));
        self.inner.subscribers.lock().insert(id, Arc::clone(&queue));
        debug!(subscription = id, "bus subscriber added");
        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Désabonnement explicite par jeton ; sans effet si déjà désabonné
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id);
    }

    /// Livre `item` à tous les abonnés courants et renvoie le nombre de
    /// destinataires. Ne bloque jamais sur un abonné lent.
    pub fn publish(&self, item: T) -> usize {
        // copie de la liste : un abonnement/désabonnement concurrent ne bloque pas la livraison
        let queues: Vec<Arc<SubscriberQueue<T>>> =
            self.inner.subscribers.lock().values().cloned().collect();

        let Some((last, rest)) = queues.split_last() else {
            return 0;
        };
        for queue in rest {
            if !queue.push(item.clone()) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !last.push(item) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queues.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Total des éléments jetés pour débordement, tous abonnés confondus
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Ferme toutes les files : les `recv` en attente renvoient None une fois vidées
    pub fn close(&self) {
        let drained: Vec<_> = self.inner.subscribers.lock().drain().collect();
        for (_, queue) in drained {
            queue.close();
        }
    }
}

/// Abonnement au bus. Le drop désabonne.
pub struct Subscription<T> {
    id: SubscriptionId,
    queue: Arc<SubscriberQueue<T>>,
    bus: Weak<BusInner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Prochain élément ; None quand l'abonnement est fermé et vidé
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.queue.items.lock().pop_front() {
                return Some(item);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.queue.items.lock().pop_front()
    }

    /// Éléments perdus par cet abonné (débordement de sa file)
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        match self.bus.upgrade() {
            Some(bus) => bus.unsubscribe(self.id),
            None => self.queue.close(),
        }
    }
}
