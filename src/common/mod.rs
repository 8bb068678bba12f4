pub mod crypto;
pub mod timer;
