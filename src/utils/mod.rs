pub mod countries;
pub mod validation;
