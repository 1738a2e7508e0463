//! Command-line policy shared by the coordinator binary and any future tools.

mod color;

pub use color::ColorWhen;
