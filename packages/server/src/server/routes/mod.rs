// HTTP routes
pub mod health;
pub mod jobs;
pub mod scans;
pub mod status;

pub use health::*;
pub use jobs::*;
pub use scans::*;
pub use status::*;
