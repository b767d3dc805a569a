pub mod core;
pub mod directory;
pub mod leaves;
pub mod substitutions;
pub mod timetable;
