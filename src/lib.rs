//! # litprof
//!
//! `litprof` measures how an application's performance depends on the literal constants in its
//! source. It rewrites literal sites with alternate values, builds every combination (locally
//! or on remote workers), runs repeated trials of each build against an unmodified reference,
//! and records the results as resumable JSON Lines streams.
//!
//! The pipeline is organized around:
//! - `mutator` and `sequencer`: value candidates per site and lockstep rounds per batch
//! - `dispatch`: local or remote builds, delivered in submission order
//! - `pipeline`: the producer and the bounded artifact channel
//! - `tester`: the consumer running reference, block and interleaved protocols
//! - `results`, `checkpoint`, `report`: persistence and summaries
//! - `driver`: wiring of a whole run

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod adaptor;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod logging;
pub mod mutator;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod results;
pub mod sequencer;
pub mod site;
pub mod tester;
