pub mod registration_store;
