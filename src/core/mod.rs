//! Runtime components of the tether binary.

pub mod supervisor;
