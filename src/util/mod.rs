pub mod completion;
pub mod random;
pub mod safe_converter;
