#![deny(future_incompatible)]
#![deny(nonstandard_style)]

#[macro_use]
extern crate slog;

pub mod bcast;
pub mod fsm;
pub mod primitives;
