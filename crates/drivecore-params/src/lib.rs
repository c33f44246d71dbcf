//! `drivecore-params` – The shared configuration store.
//!
//! Small named values shared between processes of the stack: readiness
//! flags, cached calibration, camera matrices.  Backed by a local SQLite
//! file.
//!
//! # Modules
//!
//! - [`keys`] – the registry of known keys and their lifetime class.
//! - [`store`] – [`Params`][store::Params]: the store itself.

pub mod keys;
pub mod store;

pub use keys::ParamKeyType;
pub use store::{Params, ParamsError};
