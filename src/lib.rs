// Clawdbot Gateway — library root.
//
// A long-running multi-channel agent gateway: ingests user messages from
// heterogeneous chat transports, routes each message to the right agent
// session, drives an AI model turn with tool-calling, and streams the
// replies back to the originating transport.
//
// Layout:
//   atoms/   — error types shared by everything
//   engine/  — sessions, routing, security, tools, runtime, channels,
//              orchestrator, configuration

pub mod atoms;
pub mod engine;
