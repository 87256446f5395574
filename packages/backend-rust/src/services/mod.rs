pub mod ebars;
pub mod research;
