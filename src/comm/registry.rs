//! Subscription registry: reference-counted topic filters and observers
//!
//! Tracks which topic filters are live and which observers want them. A
//! filter is subscribed on the broker exactly while its observer set is
//! non-empty; dispatch fans an inbound topic out to every observer of every
//! matching filter, in observer insertion order.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::protocol::events::CommunicationEvent;

/// What an observer wants delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    /// Parsed communication events
    Event,
    /// Verbatim topic/payload pairs
    Raw,
}

/// Item delivered to an observer channel
#[derive(Debug, Clone)]
pub(crate) enum Dispatched {
    Event(CommunicationEvent),
    Raw { topic: String, payload: Vec<u8> },
}

#[derive(Debug)]
struct Observer {
    id: u64,
    kind: ObserverKind,
    sender: mpsc::UnboundedSender<Dispatched>,
}

/// Filter paired with the observers currently interested in it
#[derive(Debug, Default)]
struct SubscriptionEntry {
    observers: Vec<Observer>,
}

/// Registry of active topic filters
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    next_observer_id: u64,
    filters: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer; the bool is true when the broker must now subscribe
    pub fn attach(
        &mut self,
        filter: &str,
        kind: ObserverKind,
        sender: mpsc::UnboundedSender<Dispatched>,
    ) -> (u64, bool) {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        let entry = self.filters.entry(filter.to_string()).or_default();
        let first = entry.observers.is_empty();
        entry.observers.push(Observer { id, kind, sender });
        (id, first)
    }

    /// Remove an observer; the bool is true when the broker must unsubscribe
    pub fn detach(&mut self, filter: &str, observer_id: u64) -> bool {
        match self.filters.get_mut(filter) {
            Some(entry) => {
                entry.observers.retain(|o| o.id != observer_id);
                if entry.observers.is_empty() {
                    self.filters.remove(filter);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Drop every observer; their streams end. Used on shutdown.
    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Filters that must be restored after a reconnect
    pub fn active_filters(&self) -> Vec<String> {
        self.filters.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn observer_count(&self, filter: &str) -> usize {
        self.filters
            .get(filter)
            .map_or(0, |entry| entry.observers.len())
    }

    /// Observer channels whose filter matches the topic, insertion-ordered
    /// per filter
    pub fn matching_observers(
        &self,
        topic: &str,
    ) -> Vec<(ObserverKind, mpsc::UnboundedSender<Dispatched>)> {
        let mut matches = Vec::new();
        for (filter, entry) in &self.filters {
            if filter_matches_topic(filter, topic) {
                for observer in &entry.observers {
                    matches.push((observer.kind, observer.sender.clone()));
                }
            }
        }
        matches
    }
}

/// MQTT topic filter matching: `+` one level, `#` any tail (including none)
pub(crate) fn filter_matches_topic(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut position = 0;
    for (index, level) in filter_levels.iter().enumerate() {
        match *level {
            "#" => return index == filter_levels.len() - 1,
            "+" => {
                if position >= topic_levels.len() {
                    return false;
                }
                position += 1;
            }
            literal => {
                if position >= topic_levels.len() || topic_levels[position] != literal {
                    return false;
                }
                position += 1;
            }
        }
    }
    position == topic_levels.len()
}
