pub mod envelope;
pub mod serve;
