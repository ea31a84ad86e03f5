// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashSet;

/// Remembers which failures were already reported.
///
/// Per-frame paths hit the same failure every frame; callers gate their
/// `warn!` on [`LogOnce::first`] so each distinct key is logged a single time.
#[derive(Debug, Default)]
pub struct LogOnce {
    seen: HashSet<String>,
}

impl LogOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `key` is seen.
    pub fn first(&mut self, key: impl AsRef<str>) -> bool {
        let key = key.as_ref();
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_owned())
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_each_key_once() {
        let mut once = LogOnce::new();
        assert!(once.first("pipeline.alias"));
        assert!(!once.first("pipeline.alias"));
        assert!(once.first("pipeline.sprite"));
        once.clear();
        assert!(once.first("pipeline.alias"));
    }
}
