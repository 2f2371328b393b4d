pub mod audit;
pub mod definition;
pub mod run;
pub mod schedule;
