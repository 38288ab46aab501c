pub mod check;
pub mod daemon;
pub mod query;
pub mod status;
