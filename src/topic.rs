//! Topic subscriptions.
//!
//! A topic is a server-side push channel emulated by long polling: the
//! client calls the procedure named after the topic with its subscriber id,
//! fires the callbacks on every non-null result and calls again. This module
//! keeps the subscription table; the pull loop lives on the client.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::Value;

/// Called with every message pushed on a topic.
pub type TopicCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Options of a subscription's pull calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Timeout of each pull in milliseconds; the client timeout when unset.
    pub timeout: Option<u64>,
    /// Rotate endpoints when a pull fails.
    pub failswitch: bool,
}

impl SubscribeOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pull timeout.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Rotate endpoints when a pull fails.
    pub fn failswitch(mut self, failswitch: bool) -> Self {
        self.failswitch = failswitch;
        self
    }
}

fn same_callback(a: &TopicCallback, b: &TopicCallback) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// topic name -> subscriber id -> callbacks
#[derive(Default)]
pub(crate) struct Topics {
    topics: BTreeMap<String, BTreeMap<String, Vec<TopicCallback>>>,
}

impl Topics {
    /// Register `callback`; true when `(name, id)` was not subscribed yet.
    pub(crate) fn add(&mut self, name: &str, id: &str, callback: TopicCallback) -> bool {
        let ids = self.topics.entry(name.to_string()).or_default();
        match ids.get_mut(id) {
            Some(callbacks) => {
                if !callbacks.iter().any(|c| same_callback(c, &callback)) {
                    callbacks.push(callback);
                }
                false
            }
            None => {
                ids.insert(id.to_string(), vec![callback]);
                true
            }
        }
    }

    /// Callbacks of `(name, id)`, `None` once unsubscribed.
    pub(crate) fn callbacks(&self, name: &str, id: &str) -> Option<Vec<TopicCallback>> {
        self.topics.get(name)?.get(id).cloned()
    }

    pub(crate) fn is_active(&self, name: &str, id: &str) -> bool {
        self.topics.get(name).is_some_and(|ids| ids.contains_key(id))
    }

    /// Drop subscriptions.
    ///
    /// Without id and callback the whole topic goes. Without id, `auto_id`
    /// is used when known, otherwise every id of the topic is affected.
    /// Without callback every callback of the id goes.
    pub(crate) fn remove(
        &mut self,
        name: &str,
        id: Option<&str>,
        callback: Option<&TopicCallback>,
        auto_id: Option<&str>,
    ) {
        if id.is_none() && callback.is_none() {
            self.topics.remove(name);
            return;
        }
        let Some(ids) = self.topics.get_mut(name) else {
            return;
        };
        match id.or(auto_id) {
            Some(id) => remove_callback(ids, id, callback),
            None => {
                let all: Vec<String> = ids.keys().cloned().collect();
                for id in all {
                    remove_callback(ids, &id, callback);
                }
            }
        }
        if ids.is_empty() {
            self.topics.remove(name);
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }
}

fn remove_callback(
    ids: &mut BTreeMap<String, Vec<TopicCallback>>,
    id: &str,
    callback: Option<&TopicCallback>,
) {
    match callback {
        Some(callback) => {
            if let Some(callbacks) = ids.get_mut(id) {
                callbacks.retain(|c| !same_callback(c, callback));
                if callbacks.is_empty() {
                    ids.remove(id);
                }
            }
        }
        None => {
            ids.remove(id);
        }
    }
}
