// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use dashmap::DashMap;

use std::{
    hash::Hash,
    sync::{Arc, Weak},
};

/// Dispatch table from session key to live session.
///
/// The table holds weak handles only: a session is owned by its supervising
/// task and the table never extends its lifetime. Sessions remove themselves
/// on teardown; lookups prune entries whose session is already gone.
pub(crate) struct Registry<K, S> {
    sessions: DashMap<K, Weak<S>>,
}

impl<K: Eq + Hash, S> Registry<K, S> {
    /// Create new [`Registry`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }

    /// Register `session` under `key`, replacing any previous entry.
    pub fn insert(&self, key: K, session: &Arc<S>) {
        self.sessions.insert(key, Arc::downgrade(session));
    }

    /// Remove the entry under `key`, if any.
    pub fn remove(&self, key: &K) {
        self.sessions.remove(key);
    }

    /// Look up the live session under `key`.
    pub fn get(&self, key: &K) -> Option<Arc<S>> {
        let session = self.sessions.get(key).and_then(|session| session.upgrade());

        if session.is_none() {
            self.sessions.remove_if(key, |_, session| session.strong_count() == 0);
        }

        session
    }

    /// Number of live sessions.
    pub fn active(&self) -> usize {
        self.sessions.retain(|_, session| session.strong_count() > 0);
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prunes_dead_sessions() {
        let registry = Registry::<&str, u32>::new();
        let session = Arc::new(1u32);

        registry.insert("alive", &session);
        assert_eq!(registry.get(&"alive"), Some(session.clone()));
        assert_eq!(registry.active(), 1);

        drop(session);
        assert_eq!(registry.get(&"alive"), None);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::<&str, u32>::new();
        let session = Arc::new(1u32);

        registry.insert("session", &session);
        registry.remove(&"session");
        registry.remove(&"session");

        assert_eq!(registry.active(), 0);
    }
}
