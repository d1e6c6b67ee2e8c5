/*
 * Lighthouse - CI/CD Job Control Plane for Kubernetes
 * Copyright (C) 2025 Lighthouse team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Lighthouse job control plane
//!
//! A `LighthouseJob` records one requested pipeline execution. This crate
//! admits jobs, turns them into Tekton pipeline runs or Jenkins builds,
//! follows their progress and mirrors it back to the source-control
//! provider as commit statuses and pull request comments.

pub mod breakpoint;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod error;
pub mod gc;
pub mod labels;
pub mod launcher;
pub mod naming;
pub mod periodic;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod reporter;
pub mod store;

// Re-export commonly used types
pub use crds::{LighthouseJob, LighthouseJobSpec, LighthouseJobStatus, PipelineKind, PipelineState};
pub use error::{Error, Result};
pub use launcher::Launcher;
