pub mod assets;
pub mod events;
pub mod session;
pub mod styles;
pub mod summary;
