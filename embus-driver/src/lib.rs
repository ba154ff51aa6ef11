//! Embus driver interface
//!
//! The crate provides an interface between a bus transport driver and the
//! Embus stack. Limited scope facilitates compatibility across versions.
//! Driver crates should depend on this crate. Embus stack users should depend
//! on the `embus` crate instead.
//!
//! The stack sits above segmentation and reassembly: a [`frame::Frame`] is one
//! fully decoded transfer with its header fields (data specifier, addresses,
//! priority, transfer sequence number) already extracted from the wire. How a
//! driver maps frames onto bus frames, generates CRCs, or manages acceptance
//! filters is its own business.
//!
//! Outbound traffic goes through [`link::FrameSink`], a synchronous
//! non-blocking send. Inbound traffic is pushed by the driver's event loop
//! into the node's dispatch entry point; there is no receive channel here.
//!
//! [`time::Clock`] abstracts the monotonic clock so that deadline bookkeeping
//! can be driven by test harnesses as well as by `embassy_time`.

#![no_std]

pub mod frame;
pub mod link;

pub mod time {
    pub use embassy_time::{Duration, Instant};

    /// Monotonic time source for deadline computation.
    ///
    /// Implementations must be free of discontinuities; wall-clock adjustments
    /// must not be visible through this trait.
    pub trait Clock {
        fn now(&self) -> Instant;
    }

    /// Clock backed by the `embassy_time` driver of the running system.
    ///
    /// Requires an `embassy_time` driver at link time (the `std` feature
    /// provides one on hosted targets).
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> Instant {
            Instant::now()
        }
    }
}
