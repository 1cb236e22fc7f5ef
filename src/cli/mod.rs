//! Command handlers for the `libreg` binary.

pub(crate) mod common;
pub(crate) mod inspect;
pub(crate) mod watch;
