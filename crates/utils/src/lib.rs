pub mod logging;
pub mod paths;
pub mod shell;
pub mod text;
