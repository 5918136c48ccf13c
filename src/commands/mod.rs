pub mod clusters;
pub mod daemon;
