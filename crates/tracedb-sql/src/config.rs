//! Engine-wide tunables, following the plain-struct-plus-`Default` pattern
//! used throughout the teacher crate's executor/config types rather than an
//! external config-file format (the core has no file-system surface, §6.3).

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the execution frame stack depth (§3.5); guards against
    /// runaway `INCLUDE` cascades rather than an actual stack overflow,
    /// since the stack itself is heap-allocated.
    pub max_include_depth: usize,
    /// Upper bound on the number of aggregate expressions a single rollup or
    /// pivot invocation may request (§4.8).
    pub max_rollup_aggregates: usize,
    /// When set, `CREATE PERFETTO VIEW` materializes its body once at
    /// creation time purely to validate column types, in addition to the
    /// mandatory column-name validation.
    pub extra_checks_on_create_view: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_include_depth: 128,
            max_rollup_aggregates: 32,
            extra_checks_on_create_view: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.max_include_depth > 0);
        assert!(config.max_rollup_aggregates >= 1);
    }
}
