pub mod admin;
pub mod backoff;
pub mod executor;
pub mod http;
pub mod recurrence;
pub mod resolver;
pub mod scheduler;

pub use admin::*;
pub use executor::*;
pub use resolver::*;
pub use scheduler::*;
