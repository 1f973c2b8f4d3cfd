//! Building blocks for [`clap`]-driven configuration of a stream consumer.
//!
//! [`clap`]: https://docs.rs/clap/
pub mod consumer;
