pub mod common;
pub mod dispatch;
pub mod setting;

pub use common::{common_routes, common_routes_with_ready};
pub use dispatch::{app, dispatch_routes};
pub use setting::setting_routes;
