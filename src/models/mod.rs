pub mod batch;
pub mod item;
