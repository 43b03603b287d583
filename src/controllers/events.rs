//! Watch event filtering
//!
//! Only the first sighting of an object triggers reconciliation. Status
//! writes made by the reconcilers arrive as updates and must not feed back
//! into the loop; in-progress work is revisited through requeues instead.

use std::collections::HashSet;

use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

/// Kind of change a watch event represents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Update,
    Delete,
    Generic,
}

/// Whether an event of this kind should trigger reconciliation
pub fn should_reconcile(kind: WatchEventKind) -> bool {
    match kind {
        WatchEventKind::Create => true,
        // passes through and finds the object gone
        WatchEventKind::Delete => true,
        WatchEventKind::Update | WatchEventKind::Generic => false,
    }
}

/// Classifies raw watcher events into create/update/delete by remembering
/// which objects have been seen.
#[derive(Debug, Default)]
pub struct EventFilter {
    seen: HashSet<String>,
    relisted: Option<HashSet<String>>,
}

impl EventFilter {
    pub fn classify<K: Resource>(
        &mut self,
        event: watcher::Event<K>,
    ) -> Option<(WatchEventKind, K)> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitApply(obj) => {
                let key = object_key(&obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                Some((self.observe(key), obj))
            }
            watcher::Event::InitDone => {
                // drop objects deleted while the watch was down
                if let Some(relisted) = self.relisted.take() {
                    self.seen.retain(|key| relisted.contains(key));
                }
                None
            }
            watcher::Event::Apply(obj) => {
                let key = object_key(&obj);
                Some((self.observe(key), obj))
            }
            watcher::Event::Delete(obj) => {
                self.seen.remove(&object_key(&obj));
                Some((WatchEventKind::Delete, obj))
            }
        }
    }

    /// Objects whose event should trigger reconciliation
    pub fn admit<K: Resource>(&mut self, event: watcher::Event<K>) -> Option<K> {
        self.classify(event)
            .filter(|(kind, _)| should_reconcile(*kind))
            .map(|(_, obj)| obj)
    }

    fn observe(&mut self, key: String) -> WatchEventKind {
        if self.seen.insert(key) {
            WatchEventKind::Create
        } else {
            WatchEventKind::Update
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    obj.uid().unwrap_or_else(|| {
        format!(
            "{}/{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        )
    })
}
