mod sweeper;

pub use sweeper::{InvalidationSweeper, SweepReport};
