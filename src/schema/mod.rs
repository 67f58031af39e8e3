pub mod delivery_log;
pub mod job;
pub mod settings;
pub mod template;

pub use delivery_log::*;
pub use job::*;
pub use settings::*;
pub use template::*;
