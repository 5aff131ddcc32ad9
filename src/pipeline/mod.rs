pub mod documents;
pub mod field_extraction;
pub mod validation;
pub mod batch_extraction;
