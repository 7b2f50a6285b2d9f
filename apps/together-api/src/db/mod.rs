pub mod backplane;
pub mod directory;
pub mod lock;
pub mod redis;
