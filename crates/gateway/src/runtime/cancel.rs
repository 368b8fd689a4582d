//! Per-operation cancellation tokens.
//!
//! Each in-flight operation registers a token derived from the process
//! shutdown scope, so both an operator's cancel request and a shutdown reach
//! the handler through the same signal. Handlers observe cancellation
//! cooperatively; the terminal state is theirs to decide.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a token for an operation, as a child of `parent`
    /// so process shutdown cancels it too.
    pub fn register(&self, operation_id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens
            .lock()
            .insert(operation_id.to_owned(), token.clone());
        token
    }

    /// Signal cancellation for an operation. Returns false when nothing is
    /// in flight under that id.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.tokens.lock().get(operation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token once the operation reaches a terminal state.
    pub fn remove(&self, operation_id: &str) {
        self.tokens.lock().remove(operation_id);
    }

    pub fn is_running(&self, operation_id: &str) -> bool {
        self.tokens.lock().contains_key(operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_cancel_remove_lifecycle() {
        let map = CancelMap::new();
        let root = CancellationToken::new();

        let token = map.register("op_1", &root);
        assert!(map.is_running("op_1"));
        assert!(!token.is_cancelled());

        assert!(map.cancel("op_1"));
        assert!(token.is_cancelled());

        map.remove("op_1");
        assert!(!map.is_running("op_1"));
        assert!(!map.cancel("op_1"));
    }

    #[test]
    fn shutdown_parent_cancels_registered_tokens() {
        let map = CancelMap::new();
        let root = CancellationToken::new();
        let token = map.register("op_1", &root);

        root.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelling_one_operation_leaves_others_running() {
        let map = CancelMap::new();
        let root = CancellationToken::new();
        let a = map.register("op_a", &root);
        let b = map.register("op_b", &root);

        map.cancel("op_a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
