//! Named fault-injection points for debug builds.
//!
//! A point is declared inline with [`fail!`] or [`fail_err!`] and is keyed by
//! `"<crate-name>::<point>"`. Points are inert until switched on with
//! [`set_fail`] (or a [`FailGuard`]), and compile to nothing in release builds.

use std::collections::BTreeMap;
use std::sync::{LazyLock, PoisonError, RwLock};

#[derive(Debug)]
pub struct Fail {
    pub name: &'static str,
}

inventory::collect!(Fail);

static FAILS: LazyLock<RwLock<BTreeMap<String, bool>>> = LazyLock::new(|| {
    RwLock::new(if cfg!(debug_assertions) {
        BTreeMap::from_iter(inventory::iter::<Fail>().map(|fail| (fail.name.to_string(), false)))
    } else {
        BTreeMap::new()
    })
});

/// Panics at this point when it is enabled.
#[macro_export]
macro_rules! fail {
    ($name:literal) => {
        #[cfg(debug_assertions)]
        {
            const NAME: &'static str = concat!(env!("CARGO_PKG_NAME"), "::", $name);

            $crate::private::inventory::submit! {
                $crate::Fail { name: NAME }
            }

            if $crate::private::should_fail(NAME) {
                panic!("Purposely panicked at '{NAME}'")
            }
        }
    };
}

/// Returns `Err($value)` (converted with `?`) from the enclosing function
/// when this point is enabled.
#[macro_export]
macro_rules! fail_err {
    ($name:literal, $value:expr) => {
        #[cfg(debug_assertions)]
        {
            const NAME: &'static str = concat!(env!("CARGO_PKG_NAME"), "::", $name);

            $crate::private::inventory::submit! {
                $crate::Fail { name: NAME }
            }

            if $crate::private::should_fail(NAME) {
                $crate::private::tracing::warn!(point = NAME, "Purposely returning error");
                Err($value)?;
            }
        }
    };
}

#[doc(hidden)]
pub mod private {
    use super::*;

    pub use inventory;
    pub use tracing;

    pub fn should_fail(name: &str) -> bool {
        FAILS
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }
}

pub fn get_state() -> BTreeMap<String, bool> {
    FAILS.read().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn set_fail(name: impl Into<String>, should_fail: bool) {
    FAILS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.into(), should_fail);
}

pub fn reset_all() {
    for value in FAILS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .values_mut()
    {
        *value = false;
    }
}

/// Enables a point for as long as the guard is alive.
#[must_use = "the fail point is disabled again when the guard is dropped"]
pub struct FailGuard {
    name: String,
}

impl FailGuard {
    pub fn enable(name: impl Into<String>) -> Self {
        let name = name.into();
        set_fail(name.clone(), true);
        Self { name }
    }
}

impl Drop for FailGuard {
    fn drop(&mut self) {
        set_fail(std::mem::take(&mut self.name), false);
    }
}
