//! Wire-level block model and line codec for the Asterisk Manager
//! Interface (AMI).
//!
//! AMI frames everything as *blocks*: a sequence of `Key: Value` ASCII
//! lines terminated by a blank line. Actions sent to the switch and
//! responses/events received from it share the same framing; the only
//! distinction is which keys are present (`Action`, `Response`,
//! `Event`, `ActionID`).
//!
//! This crate is purely about framing and the block data model. It has
//! no opinion on transport or correlation; those live in
//! `ringflow-ami-client`.

pub mod block;
pub mod codec;
pub mod error;

pub use block::{Action, Block};
pub use codec::{encode_block, BlockDecoder};
pub use error::{CodecError, Result};
