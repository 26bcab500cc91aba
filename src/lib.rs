//! Flownote Session Orchestration Engine
//!
//! The server-side per-user actor that ingests voice-activity events,
//! transcripts, frame embeddings, and video-context updates; drives a
//! speech-to-transcript-to-structured-note pipeline under latency and
//! backpressure constraints; persists notes; and fans updates out over a
//! real-time pub/sub bus to reconnecting subscribers.

pub mod bus;
pub mod channel;
pub mod clients;
pub mod config;
pub mod jobs;
pub mod notes;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod telemetry;
