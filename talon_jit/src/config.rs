//! JIT configuration resolved once at VM startup.
//!
//! Every knob has a compiled-in default and may be overridden through a
//! `TALON_JIT_*` environment variable. The struct is immutable after
//! construction; the compiler only reads it.

use std::env;

/// Default upper bound on a single method's native code.
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Default bound on literal-pool entries per method.
pub const DEFAULT_MAX_POOL_ENTRIES: usize = 1024;

/// Slack kept between the current position and the literal reach limit.
pub const DEFAULT_POOL_MARGIN: u32 = 64;

// =============================================================================
// JIT Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Methods whose code would exceed this many bytes stay interpreted.
    pub max_code_size: usize,

    /// Literal-pool entries allowed per method.
    pub max_pool_entries: usize,

    /// Bytes of headroom before a literal pool is forced out.
    pub pool_margin: u32,

    /// Allow store-multiple flushes on targets that have them.
    pub bulk_flush: bool,

    /// Let float values take part in store-multiple flushes.
    pub float_bulk_flush: bool,

    /// Reuse registers of locals that are never read again.
    pub local_liveness: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_pool_entries: DEFAULT_MAX_POOL_ENTRIES,
            pool_margin: DEFAULT_POOL_MARGIN,
            bulk_flush: true,
            float_bulk_flush: false,
            local_liveness: true,
        }
    }
}

impl JitConfig {
    /// Resolve configuration from the defaults plus environment overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_code_size: Self::env_usize("TALON_JIT_MAX_CODE_SIZE")
                .unwrap_or(defaults.max_code_size),
            max_pool_entries: Self::env_usize("TALON_JIT_MAX_POOL_ENTRIES")
                .unwrap_or(defaults.max_pool_entries),
            pool_margin: defaults.pool_margin,
            bulk_flush: Self::env_flag("TALON_JIT_BULK_FLUSH").unwrap_or(defaults.bulk_flush),
            float_bulk_flush: Self::env_flag("TALON_JIT_FLOAT_BULK_FLUSH")
                .unwrap_or(defaults.float_bulk_flush),
            local_liveness: Self::env_flag("TALON_JIT_LIVENESS")
                .unwrap_or(defaults.local_liveness),
        }
    }

    pub fn with_max_code_size(mut self, bytes: usize) -> Self {
        self.max_code_size = bytes;
        self
    }

    pub fn with_max_pool_entries(mut self, entries: usize) -> Self {
        self.max_pool_entries = entries;
        self
    }

    pub fn with_bulk_flush(mut self, enabled: bool) -> Self {
        self.bulk_flush = enabled;
        self
    }

    pub fn with_float_bulk_flush(mut self, enabled: bool) -> Self {
        self.float_bulk_flush = enabled;
        self
    }

    pub fn with_local_liveness(mut self, enabled: bool) -> Self {
        self.local_liveness = enabled;
        self
    }

    // =========================================================================
    // Environment helpers
    // =========================================================================

    fn env_usize(name: &str) -> Option<usize> {
        Self::parse_usize(&env::var(name).ok()?)
    }

    fn env_flag(name: &str) -> Option<bool> {
        Self::parse_flag(&env::var(name).ok()?)
    }

    fn parse_usize(raw: &str) -> Option<usize> {
        let raw = raw.trim();
        match raw.strip_suffix('k').or_else(|| raw.strip_suffix('K')) {
            Some(kib) => kib.parse::<usize>().ok()?.checked_mul(1024),
            None => raw.parse().ok(),
        }
    }

    fn parse_flag(raw: &str) -> Option<bool> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        }
    }
}
