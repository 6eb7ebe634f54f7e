pub mod ids;
pub mod report;
pub mod route;
pub mod session;

pub use ids::*;
pub use report::*;
pub use route::*;
pub use session::*;
