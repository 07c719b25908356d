//! Compile-time configuration of the portability layer.
//!
//! Per-kernel values (tick rate, priorities, default stack size, task bound)
//! live as associated constants on [`Kernel`]; the helpers below read them so
//! integrators have one place to look.

use kport_hal::Kernel;
use static_assertions::const_assert;

pub use kport_common::time::{SysTime, INFINITE_DELAY, MAX_DELAY};

/// Size of the semaphore identifier table.
///
/// Kernels advertising more slots than this are capped here.
pub const MAX_SLOTS: usize = 64;

/// Reserved identifier meaning "no slot".
pub const INVALID_SLOT: u8 = u8::MAX;

/// Extra non-blocking takes allowed, beyond the known pending count, when
/// clearing an emulated event.
pub const DRAIN_LIMIT: usize = 256;

const_assert!(MAX_SLOTS >= 1);
const_assert!(MAX_SLOTS <= INVALID_SLOT as usize);
const_assert!(DRAIN_LIMIT >= 1);

/// Milliseconds to native ticks for kernel `K`.
pub const fn ms_to_ticks<K: Kernel>(ms: SysTime) -> u32 {
    kport_common::time::ms_to_ticks(ms, K::TICK_RATE_HZ)
}

/// Native ticks to milliseconds for kernel `K`.
pub const fn ticks_to_ms<K: Kernel>(ticks: u64) -> u64 {
    kport_common::time::ticks_to_ms(ticks, K::TICK_RATE_HZ)
}

/// Number of identifier slots the layer manages for kernel `K`.
pub const fn slot_count<K: Kernel>() -> usize {
    if K::SEMAPHORE_SLOTS < MAX_SLOTS {
        K::SEMAPHORE_SLOTS
    } else {
        MAX_SLOTS
    }
}
