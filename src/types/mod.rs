#![forbid(unsafe_code)]

//! Core types shared across the bucket engine.

mod error;
pub mod ident;

pub use error::{BucketError, Result};
pub use ident::{IdColumn, ObjectId};
