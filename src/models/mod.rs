pub mod essay;
pub mod grading;
