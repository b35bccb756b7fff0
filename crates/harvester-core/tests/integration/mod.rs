mod common;
mod resume_tests;
