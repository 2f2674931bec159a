pub mod switch;

pub use switch::*;
