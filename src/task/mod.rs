//! Task descriptors and admission validation.

pub mod descriptor;
pub mod validator;

pub use descriptor::{Priority, Task};
pub use validator::{TaskValidator, ValidationReport};
