pub mod cmd;
pub mod fs;
