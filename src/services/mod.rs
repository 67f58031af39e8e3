pub mod audit;
pub mod gateway;
pub mod settings;
pub mod templates;

pub use audit::*;
pub use gateway::*;
pub use settings::*;
pub use templates::*;
