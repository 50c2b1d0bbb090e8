use smallvec::SmallVec;
use std::fmt;

/// A trace subscriber, notified with `(old, new)` on every change.
pub type TraceFn<T> = Box<dyn FnMut(T, T)>;

/// A value that publishes `(old, new)` to its subscribers whenever it
/// changes.
///
/// Congestion controllers trace their window through this; an experiment
/// driver attaches one closure per flow to record the evolution of `cwnd`
/// (and `base_rtt` for the Vegas variant) without reaching into controller
/// state.
pub struct Traced<T> {
    value: T,
    subscribers: SmallVec<[TraceFn<T>; 2]>,
}

impl<T: Copy + PartialEq> Traced<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            subscribers: SmallVec::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn set(&mut self, new: T) {
        let old = self.value;
        self.value = new;
        if old != new {
            for cb in &mut self.subscribers {
                cb(old, new);
            }
        }
    }

    pub fn subscribe(&mut self, cb: TraceFn<T>) {
        self.subscribers.push(cb);
    }
}

impl<T: fmt::Debug> fmt::Debug for Traced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traced")
            .field("value", &self.value)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
