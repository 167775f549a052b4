pub mod participant;
pub mod signaling;
