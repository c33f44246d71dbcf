//! `drivecore-middleware` – The Nervous System
//!
//! Routes asynchronous data between the camera feed, the perception core and
//! downstream consumers without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels, plus a deadline-aware blocking receiver for
//!   real-time threads.
//! - [`adapter`] – the [`Transport`] trait the output publisher writes
//!   through.

pub mod adapter;
pub mod bus;

pub use adapter::Transport;
pub use bus::{BlockingReceiver, EventBus, RecvTimeoutError, Topic, TopicReceiver};
