pub mod value;

pub use value::{Properties, Value};
