#![allow(dead_code)]

pub mod builders;
pub mod db;
pub mod flow;

pub use builders::{ClientBuilder, UserBuilder};
pub use db::TestDb;
pub use flow::{ContendedPolls, FixedCodes, Harness, StubIssuer, T0};
