pub mod refresh;
pub mod status;
pub mod validate;
