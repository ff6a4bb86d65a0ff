//! Registry mapping wire-stable action ids to active-message handlers.
//!
//! The slab key of a handler doubles as its on-the-wire id, so every unit of
//! a team must register the same handlers in the same order before opening a
//! queue. The registry is frozen once the queue is open (it is shared as
//! `Arc<ActionRegistry>`), which makes dispatch lock-free and lets handlers
//! issue `try_send`/`bsend` recursively.

use slab::Slab;

/// Wire-stable identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(pub(crate) u32);

impl ActionId {
    /// The raw id carried in message headers.
    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }
}

type Action = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Registry of active-message handlers.
pub struct ActionRegistry {
    actions: Slab<Action>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            actions: Slab::new(),
        }
    }

    /// Register a handler and return its id.
    ///
    /// Registration order determines the id; all units of a team must agree
    /// on it.
    pub fn register<F>(&mut self, action: F) -> ActionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        ActionId(self.actions.insert(Box::new(action)) as u32)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn get(&self, id: u32) -> Option<&Action> {
        self.actions.get(id as usize)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
