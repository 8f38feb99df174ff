pub mod identity;
pub mod queue_message;
