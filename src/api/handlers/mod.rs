pub mod admin;
pub mod orders;
pub mod quotes;
pub mod system;

pub use admin::*;
pub use orders::*;
pub use quotes::*;
pub use system::*;
