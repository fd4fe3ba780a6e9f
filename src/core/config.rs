//! Emitter configuration.
//!
//! Defaults match a release compiler. [`EmitterConfig::from_env`] overlays
//! `IGEMIT_*` environment variables so stress modes can be switched on without
//! touching the embedding compiler.

use std::env;

use crate::instr::desc::DEFAULT_SCRATCH_BYTES;

/// Conservative byte budget reserved for a prolog/epilog placeholder.
pub const MAX_PLACEHOLDER_IG_SIZE: u32 = 256;

/// Deepest argument stack (in slots) tracked with the inline bitmask form.
pub const MAX_SIMPLE_STK_DEPTH: u32 = 32;

/// Knobs for one [`crate::emit::Emitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Isolate every instruction in its own group (outside prologs/epilogs).
    pub stress_new_groups: bool,
    /// Byte budget of the group builder's scratch buffer.
    pub scratch_capacity: usize,
    /// Byte budget reserved for each prolog/epilog placeholder.
    pub placeholder_size: u32,
    /// Report every GC register transition instead of call sites only.
    pub fully_interruptible: bool,
    /// Run consistency checks (funclet crossings, offset agreement).
    pub validate: bool,
    /// Largest stack depth, in slots, still tracked with a bitmask.
    pub max_simple_stack_depth: u32,
    /// Largest number of instruction groups per method.
    pub max_groups: u32,
    /// Optional cap on arena growth, in bytes.
    pub arena_limit: Option<usize>,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            stress_new_groups: false,
            scratch_capacity: DEFAULT_SCRATCH_BYTES,
            placeholder_size: MAX_PLACEHOLDER_IG_SIZE,
            fully_interruptible: false,
            validate: cfg!(debug_assertions),
            max_simple_stack_depth: MAX_SIMPLE_STK_DEPTH,
            max_groups: u16::MAX as u32,
            arena_limit: None,
        }
    }
}

impl EmitterConfig {
    /// Defaults overlaid with `IGEMIT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IGEMIT_STRESS") {
            self.stress_new_groups = parse_flag(&v);
        }
        if let Some(v) = lookup("IGEMIT_FULLY_INTERRUPTIBLE") {
            self.fully_interruptible = parse_flag(&v);
        }
        if let Some(v) = lookup("IGEMIT_VALIDATE") {
            self.validate = parse_flag(&v);
        }
        if let Some(v) = lookup("IGEMIT_SCRATCH_BYTES") {
            match v.parse::<usize>() {
                Ok(bytes) if bytes > 0 => self.scratch_capacity = bytes,
                _ => log::warn!("ignoring IGEMIT_SCRATCH_BYTES={v:?}"),
            }
        }
        if let Some(v) = lookup("IGEMIT_ARENA_LIMIT") {
            match v.parse::<usize>() {
                Ok(bytes) => self.arena_limit = Some(bytes),
                Err(_) => log::warn!("ignoring IGEMIT_ARENA_LIMIT={v:?}"),
            }
        }
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EmitterConfig::default();
        assert_eq!(config.placeholder_size, 256);
        assert_eq!(config.max_simple_stack_depth, 32);
        assert!(!config.stress_new_groups);
        assert_eq!(config.scratch_capacity, DEFAULT_SCRATCH_BYTES);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IGEMIT_STRESS", "1"),
            ("IGEMIT_FULLY_INTERRUPTIBLE", "true"),
            ("IGEMIT_SCRATCH_BYTES", "512"),
            ("IGEMIT_ARENA_LIMIT", "bogus"),
        ]
        .into_iter()
        .collect();

        let config =
            EmitterConfig::default().with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.stress_new_groups);
        assert!(config.fully_interruptible);
        assert_eq!(config.scratch_capacity, 512);
        assert_eq!(config.arena_limit, None);
    }
}
