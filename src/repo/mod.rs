pub mod migrations;
pub mod records;
