/// Handle returned by [`Subscribers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// An ordered list of callbacks for one kind of event. Every subscriber sees
/// every event, in subscription order.
pub struct Subscribers<E> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Box<dyn FnMut(&E) + Send>)>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<E> Subscribers<E> {
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in self.entries.iter_mut() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn delivers_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subscribers = Subscribers::<u32>::default();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            subscribers.subscribe(move |n| seen.lock().unwrap().push(format!("{}:{}", tag, n)));
        }
        subscribers.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn unsubscribed_callbacks_stop_firing() {
        let count = Arc::new(Mutex::new(0));
        let mut subscribers = Subscribers::<()>::default();
        let counter = count.clone();
        let id = subscribers.subscribe(move |_| *counter.lock().unwrap() += 1);
        subscribers.emit(&());
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.emit(&());
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(subscribers.is_empty());
    }
}
