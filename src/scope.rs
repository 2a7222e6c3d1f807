use std::collections::HashSet;

/// Ordered stack of locally bound names.
///
/// Pushed when entering a scoping construct (`for`, `with`, `def`, ...) and
/// popped on leaving it. A name is local if any active scope binds it;
/// otherwise it refers to the render context.
#[derive(Debug, Clone)]
pub(crate) struct ScopeStack {
    scopes: Vec<HashSet<String>>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    /// A stack holding a single, empty root scope.
    pub(crate) fn new() -> Self {
        Self {
            scopes: vec![HashSet::new()],
        }
    }

    pub(crate) fn push(&mut self) {
        self.scopes.push(HashSet::new());
    }

    /// Pops the innermost scope. The root scope is never popped.
    pub(crate) fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Binds `name` in the innermost scope.
    pub(crate) fn bind(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    /// Binds `name` in the root scope, for template-wide bindings.
    pub(crate) fn bind_root(&mut self, name: &str) {
        if let Some(scope) = self.scopes.first_mut() {
            scope.insert(name.to_string());
        }
    }

    pub(crate) fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_push_pop_is_lifo() {
        let mut scopes = ScopeStack::new();
        scopes.bind("site");
        scopes.push();
        scopes.bind("item");
        assert!(scopes.is_local("item"));
        assert!(scopes.is_local("site"));
        scopes.pop();
        assert!(!scopes.is_local("item"));
        assert!(scopes.is_local("site"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_root_is_never_popped() {
        let mut scopes = ScopeStack::new();
        scopes.bind("site");
        scopes.pop();
        scopes.pop();
        assert!(scopes.is_local("site"));
        scopes.bind("page");
        assert!(scopes.is_local("page"));
        scopes.push();
        scopes.bind_root("title");
        scopes.pop();
        assert!(scopes.is_local("title"));
    }
}
