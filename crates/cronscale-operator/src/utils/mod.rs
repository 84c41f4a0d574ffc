pub mod retry;
pub mod signal;
