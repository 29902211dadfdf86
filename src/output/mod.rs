pub mod render;
pub mod schema;
pub mod writer;

pub use render::{RenderMode, render};
