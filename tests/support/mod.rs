pub mod harness;
pub mod net;
