#![doc = "file2ai-core: job orchestration and conversion dispatch for file2ai."]

//! This crate holds all business logic: filtering, source resolution,
//! repository export, conversion dispatch, job lifecycle and packaging.
//! HTTP and CLI glue live in the `file2ai` crate.
//!
//! # Usage
//! Build a [`registry::JobRegistry`] with a [`contract::Converter`] and a
//! [`contract::RepoFetcher`], then submit [`registry::JobRequest`]s and poll
//! their snapshots.

pub mod code_to_pdf;
pub mod config;
pub mod contract;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod glob;
pub mod job;
pub mod package;
pub mod pipeline;
pub mod registry;
pub mod repo_export;
pub mod source;
