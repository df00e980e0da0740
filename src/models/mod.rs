pub mod batch;
pub mod cfdi;
pub mod job;
pub mod verification;
