pub mod credential;
pub mod registration;
