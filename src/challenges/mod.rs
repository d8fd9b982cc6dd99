// Challenge detection plus the browser engines that solve challenges.

pub mod core;
pub mod detectors;
pub mod engines;
