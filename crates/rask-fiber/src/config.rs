// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults can be overridden per process with `RASK_FIBER_STACK_SIZE`
//! (bytes) and `RASK_FIBER_GUARD_PAGES`.

use std::env;

/// Unit used for the default stack size, independent of the real page size.
const STACK_UNIT: usize = 4096;

/// Default number of stack units per fiber.
#[cfg(target_pointer_width = "64")]
const DEFAULT_STACK_UNITS: usize = 128;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_STACK_UNITS: usize = 16;

/// Protected pages below every fiber stack.
pub const DEFAULT_GUARD_PAGES: usize = 4;

/// Smallest stack a fiber is given, whatever was requested.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

pub const STACK_SIZE_VAR: &str = "RASK_FIBER_STACK_SIZE";
pub const GUARD_PAGES_VAR: &str = "RASK_FIBER_GUARD_PAGES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Usable stack bytes for each task fiber.
    pub stack_size: usize,
    /// Guard pages reserved below each stack. 0 disables them.
    pub guard_pages: usize,
}

impl Config {
    pub fn new() -> Self {
        Self {
            stack_size: STACK_UNIT * DEFAULT_STACK_UNITS,
            guard_pages: DEFAULT_GUARD_PAGES,
        }
    }

    /// Defaults, overridden by environment variables when they parse.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(size) = read_var(STACK_SIZE_VAR) {
            config.stack_size = size;
        }
        if let Some(pages) = read_var(GUARD_PAGES_VAR) {
            config.guard_pages = pages;
        }
        config
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_guard_pages(mut self, guard_pages: usize) -> Self {
        self.guard_pages = guard_pages;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn read_var(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match parse_size(&raw) {
        Some(v) => Some(v),
        None => {
            log::warn!("ignoring {name}={raw:?}: expected a non-negative integer");
            None
        }
    }
}

/// Accepts plain byte counts plus `k`/`m` suffixes (`512k`, `1m`).
fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, scale) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 1024),
        b'm' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s.as_str(), 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}
