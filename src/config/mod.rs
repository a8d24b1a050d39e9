pub mod types;
pub mod loader;
pub mod runtime;
pub mod validator;

pub use types::*;
pub use loader::*;
pub use runtime::RuntimeConfig;
pub use validator::*;
