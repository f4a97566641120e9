//! Device models built on the virtqueue engine.

pub mod rng;

pub use rng::VirtioRng;
