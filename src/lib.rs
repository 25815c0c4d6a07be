//! Quizgen worker: background generation of personalized quiz questions.

pub mod admin;
pub mod ai;
pub mod config;
pub mod error;
pub mod store;
pub mod worker;
