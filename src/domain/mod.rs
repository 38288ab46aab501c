pub mod cache;
pub mod model;
pub mod normalize;
pub mod raw;
pub mod service;
pub mod store;
