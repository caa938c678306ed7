mod cloud_api;
mod prompt;

pub use cloud_api::*;
pub use prompt::*;
