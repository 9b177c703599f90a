pub mod hash;
pub mod time;
pub mod url;
