//! Platform abstraction layer for clocks and processor time.
//!
//! Everything in the crate that reads a clock goes through this layer, so tests can drive
//! durations, processor time and calendar days deterministically.

mod abstractions;
mod facade;
#[cfg(test)]
mod fake;
mod real;

pub(crate) use abstractions::Platform;
pub(crate) use facade::PlatformFacade;
#[cfg(test)]
pub(crate) use fake::FakePlatform;
