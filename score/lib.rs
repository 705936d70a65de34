#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod engine;
pub mod io;
pub mod linalg;
pub mod pipeline;
pub mod types;

#[path = "../survival/mod.rs"]
pub mod survival;

#[path = "../profit/mod.rs"]
pub mod profit;

#[path = "../segment/mod.rs"]
pub mod segment;

#[path = "../calibrate/mod.rs"]
pub mod calibrate;
