//! Startup warnings surfaced on the system API.

use parking_lot::RwLock;

/// Non-fatal problems collected during startup (skipped providers,
/// missing config sections) plus anything background services add later.
#[derive(Default)]
pub struct SystemWarnings {
    warnings: RwLock<Vec<String>>,
}

impl SystemWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(warning = %warning, "system warning");
        self.warnings.write().push(warning);
    }

    pub fn extend(&self, warnings: impl IntoIterator<Item = String>) {
        for warning in warnings {
            self.add(warning);
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.warnings.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_accumulate_in_order() {
        let warnings = SystemWarnings::new();
        warnings.add("first");
        warnings.extend(vec!["second".to_string(), "third".to_string()]);
        assert_eq!(warnings.list(), ["first", "second", "third"]);
    }
}
