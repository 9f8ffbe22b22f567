//! Integer handles for frames and variable containers.
//!
//! Handles only live until the engine resumes; after that the engine's
//! stack and property tree may look completely different.

use std::collections::HashMap;

/// First handle handed out. Zero means "no children" in DAP.
const START: i64 = 1;

/// A table of values addressed by small positive integers.
#[derive(Debug, Clone)]
pub struct Handles<T> {
    next: i64,
    items: HashMap<i64, T>,
}

impl<T> Default for Handles<T> {
    fn default() -> Self {
        Self {
            next: START,
            items: HashMap::new(),
        }
    }
}

impl<T> Handles<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` and return its handle.
    pub fn create(&mut self, value: T) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.items.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.items.get(&handle)
    }

    /// Forget every handle and start numbering again.
    pub fn reset(&mut self) {
        self.items.clear();
        self.next = START;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A stack frame at the last stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    /// Stack depth, 0 being the current frame.
    pub depth: u32,
}

/// Something whose children the front end can ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableRef {
    /// All variables of one context (`Local`, `Global`, ...).
    Context { depth: u32, context_id: u32 },
    /// The children of an object-valued property. `context_id` is `None`
    /// for results of `evaluate`, which let the engine pick the context.
    Property {
        depth: u32,
        context_id: Option<u32>,
        full_name: String,
    },
}
