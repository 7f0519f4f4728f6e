//! Default lifetimes per scope and per category.

use std::collections::HashMap;
use std::time::Duration;

use crate::entry::{MAX_TTL, Scope};

/// Resolves the TTL of an entry when the producer does not pass one.
///
/// Resolution order: explicit TTL, category override, scope default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    session: Duration,
    project: Duration,
    global: Duration,
    categories: HashMap<String, Duration>,
}

impl RetentionPolicy {
    /// Creates a policy with the supplied per-scope defaults.
    #[must_use]
    pub fn new(session: Duration, project: Duration, global: Duration) -> Self {
        Self {
            session,
            project,
            global,
            categories: HashMap::new(),
        }
    }

    /// Adds a lifetime override for entries tagged with `category`.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.categories.insert(category.into(), ttl);
        self
    }

    /// Default lifetime of a scope.
    #[must_use]
    pub fn scope_default(&self, scope: Scope) -> Duration {
        match scope {
            Scope::Session => self.session,
            Scope::Project => self.project,
            Scope::Global => self.global,
        }
    }

    /// Resolves the lifetime for an entry, clamped to [`MAX_TTL`].
    #[must_use]
    pub fn resolve(&self, explicit: Option<Duration>, scope: Scope, category: &str) -> Duration {
        explicit
            .or_else(|| self.categories.get(category).copied())
            .unwrap_or_else(|| self.scope_default(scope))
            .min(MAX_TTL)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(60 * 60),
            Duration::from_secs(7 * 24 * 60 * 60),
            Duration::from_secs(30 * 24 * 60 * 60),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order() {
        let policy = RetentionPolicy::default().with_category("conversation", Duration::from_secs(90));

        assert_eq!(
            policy.resolve(Some(Duration::from_secs(5)), Scope::Global, "conversation"),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.resolve(None, Scope::Global, "conversation"),
            Duration::from_secs(90)
        );
        assert_eq!(
            policy.resolve(None, Scope::Project, "notes"),
            Duration::from_secs(7 * 24 * 60 * 60)
        );
    }
}
