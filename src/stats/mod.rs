pub mod definitions;
pub mod event;
pub mod intake;
pub mod map;
pub mod precision;
pub mod rollup;
