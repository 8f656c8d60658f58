//! Core implementation of the IAM reconciliation engine

pub mod batch;
pub mod config;
pub mod error;
pub mod iam;
pub mod mutex;
pub mod retry;
