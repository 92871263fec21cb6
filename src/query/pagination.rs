use serde::{Deserialize, Serialize};

/// Page size defaults and ceiling for collection reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub limit_default: i32,
    pub limit_max: i32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self { limit_default: 20, limit_max: 100 }
    }
}

/// Effective limit and offset for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

/// Resolves a requested page against the configured defaults.
///
/// A non-positive limit falls back to `limit_default`; anything above
/// `limit_max` is capped. Offsets are clamped at zero and otherwise unbounded,
/// so deep pages cost a proportionally larger skip in the store.
#[must_use]
pub fn resolve(limit: i32, offset: i32, cfg: &PaginationConfig) -> Page {
    let limit = if limit <= 0 { cfg.limit_default } else { limit.min(cfg.limit_max) };
    Page { limit: i64::from(limit), offset: i64::from(offset.max(0)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_ceiling() {
        let cfg = PaginationConfig { limit_default: 20, limit_max: 100 };
        assert_eq!(resolve(0, 0, &cfg), Page { limit: 20, offset: 0 });
        assert_eq!(resolve(500, 0, &cfg).limit, 100);
        assert_eq!(resolve(-5, 0, &cfg).limit, 20);
        assert_eq!(resolve(35, -3, &cfg), Page { limit: 35, offset: 0 });
        assert_eq!(resolve(35, 1_000_000, &cfg).offset, 1_000_000);
    }
}
