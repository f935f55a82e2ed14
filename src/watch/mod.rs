pub mod adapter;
pub mod filter;

pub use adapter::FsWatcher;
pub use filter::TargetWatcher;
