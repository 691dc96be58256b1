//! Execution mode selection.
//!
//! This module defines the two execution modes every kernel supports and
//! provides functions to set and get the current one.
//!
//! # Modes
//!
//! - `Parallel`: loop iterations are spread across the `rayon` thread pool (default).
//! - `Sequential`: the same iterations run in order on the calling thread.
//!
//! Both modes produce bit-identical output: kernels only ever split work into
//! independent iterations whose arithmetic does not depend on scheduling.
//!
//! The mode is stored globally using an `AtomicU8`. Its initial value is read
//! once from the `T4_SEQUENTIAL` environment variable; `with_backend` installs
//! a per-thread override that takes precedence over the global value.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};
use std::cell::Cell;
use std::sync::Once;

/// Name of the environment flag that selects [`Backend::Sequential`] at startup.
pub const SEQUENTIAL_ENV: &str = "T4_SEQUENTIAL";

/// Enumeration of supported execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Data-parallel execution on the `rayon` pool (default).
    #[default]
    Parallel = 0,
    /// Deterministic in-order execution on the calling thread.
    Sequential,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Parallel),
            1 => Ok(Self::Sequential),
            _ => Err(()),
        }
    }
}

static GLOBAL_BACKEND: AtomicU8 = AtomicU8::new(Backend::Parallel as u8);
static ENV_INIT: Once = Once::new();

thread_local! {
    static OVERRIDE: Cell<Option<Backend>> = const { Cell::new(None) };
}

/// Reads a boolean flag from the environment.
fn boolean_env_flag_set(flag: &str) -> bool {
    match std::env::var(flag) {
        Ok(val) => ["1", "on", "ON", "true", "TRUE", "yes", "YES"].contains(&val.as_str()),
        Err(_) => false,
    }
}

fn init_from_env() {
    ENV_INIT.call_once(|| {
        if boolean_env_flag_set(SEQUENTIAL_ENV) {
            tracing::debug!("{SEQUENTIAL_ENV} set, starting in sequential mode");
            GLOBAL_BACKEND.store(Backend::Sequential as u8, Ordering::Release);
        }
    });
}

/// Sets the execution mode used by every kernel.
///
/// # Example
///
/// ```
/// use tensor4::backend::{set_backend, Backend};
/// set_backend(Backend::Sequential);
/// set_backend(Backend::Parallel);
/// ```
pub fn set_backend(b: Backend) {
    init_from_env();
    tracing::debug!(backend = ?b, "switching execution mode");
    GLOBAL_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the active execution mode.
///
/// A `with_backend` override on the current thread wins over the global value.
/// If the stored value is invalid, defaults to [`Backend::Parallel`].
pub fn get_backend() -> Backend {
    if let Some(b) = OVERRIDE.with(Cell::get) {
        return b;
    }
    init_from_env();
    Backend::try_from(GLOBAL_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

/// Runs `f` with `backend` active on the current thread only.
///
/// The previous override is restored when `f` returns or unwinds.
pub fn with_backend<R>(backend: Backend, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Backend>);

    impl Drop for Restore {
        fn drop(&mut self) {
            OVERRIDE.with(|o| o.set(self.0));
        }
    }

    let _restore = Restore(OVERRIDE.with(|o| o.replace(Some(backend))));
    f()
}

/// Number of execution units available to a parallel loop: the pool size in
/// parallel mode, one otherwise.
pub fn max_threads() -> usize {
    match get_backend() {
        Backend::Parallel => rayon::current_num_threads().max(1),
        Backend::Sequential => 1,
    }
}
