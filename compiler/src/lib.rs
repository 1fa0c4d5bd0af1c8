// ptc — Partitioned Thread Compiler
//
// Library root. Compile-time passes (validate, insert, synth) turn a
// partitioned dataflow graph into a ProgramPlan; the runtime modules
// (channel, worker, bridge, runtime) execute one.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod diag;
pub mod domain;
pub mod dot;
pub mod graph;
pub mod id;
pub mod insert;
pub mod pass;
pub mod pipeline;
pub mod poll;
pub mod rate;
pub mod runtime;
pub mod sample;
pub mod synth;
pub mod transport;
pub mod worker;
