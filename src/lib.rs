// Style lints this codebase does not follow.
#![allow(
    clippy::manual_range_contains,
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod app;
pub mod common;
pub mod config;
pub mod netstack;
pub mod proxy;
pub mod router;
