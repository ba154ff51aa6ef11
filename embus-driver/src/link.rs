//! Outbound transport interface

use crate::frame::Frame;

/// Transport-level send failure
///
/// The distinction matters to callers only as far as logging goes; either way
/// the frame was not accepted and no part of it will appear on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    /// The driver's transmit queue has no room for the frame.
    QueueFull,
    /// The transport is not operational (bus-off, not initialized, ...).
    Down,
}

/// Non-blocking frame transmission
///
/// Implemented by transport drivers. `try_send` either accepts the whole frame
/// for transmission or rejects it without side effects; it must not block.
pub trait FrameSink {
    fn try_send(&mut self, frame: &Frame) -> Result<(), SendError>;
}

impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    fn try_send(&mut self, frame: &Frame) -> Result<(), SendError> {
        (**self).try_send(frame)
    }
}
