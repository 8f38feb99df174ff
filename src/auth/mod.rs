pub mod gate;
pub mod token;
