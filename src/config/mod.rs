pub mod loader;
pub mod model;
pub mod resolve;

pub use loader::load_and_resolve;
pub use model::RawConfig;
pub use resolve::ResolvedConfig;
